//! Lighthouse performance sidecar client.
//!
//! The sidecar is an opaque HTTP endpoint: `POST {base}/run {url, html}`
//! returns a scored report. Sidecar failures never abort the job; they are
//! recorded in the report and the policy evaluator fails the performance
//! dimension.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::PerfConfig;
use crate::policy::PerfMetrics;

#[derive(Deserialize)]
struct SidecarReport {
    url: Option<String>,
    performance_score: Option<f64>,
    metrics: Option<SidecarMetrics>,
    #[serde(rename = "reportHtml")]
    report_html: Option<String>,
}

#[derive(Deserialize)]
struct SidecarMetrics {
    lcp: Option<f64>,
    cls: Option<f64>,
    tti: Option<f64>,
}

/// Performance section of a result summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PerfMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PerfClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl PerfClient {
    pub fn from_config(config: &PerfConfig) -> Option<Self> {
        Some(Self {
            base_url: config.url.clone()?.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
        })
    }

    /// Run the sidecar against one URL. The HTML report, when present, is
    /// returned separately so the executor can persist it as an artifact.
    pub async fn run(&self, url: &str) -> (PerfReport, Option<String>) {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .json(&serde_json::json!({ "url": url, "html": true }))
            .timeout(self.timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return (
                    PerfReport {
                        error: Some(format!("lighthouse_failed:{err}")),
                        ..Default::default()
                    },
                    None,
                );
            }
        };

        if response.status().as_u16() >= 400 {
            return (
                PerfReport {
                    error: Some(format!("lighthouse_status_{}", response.status().as_u16())),
                    ..Default::default()
                },
                None,
            );
        }

        match response.json::<SidecarReport>().await {
            Ok(report) => {
                let metrics = report.metrics.map(|m| PerfMetrics {
                    lcp_ms: m.lcp,
                    cls: m.cls,
                    tti_ms: m.tti,
                });
                (
                    PerfReport {
                        url: report.url,
                        performance_score: report.performance_score,
                        metrics,
                        report_path: None,
                        error: None,
                    },
                    report.report_html,
                )
            }
            Err(err) => (
                PerfReport {
                    error: Some(format!("lighthouse_failed:{err}")),
                    ..Default::default()
                },
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_report_mapping() {
        let raw = r#"{
            "url": "https://x.test/",
            "performance_score": 87.0,
            "metrics": {"lcp": 1900.0, "cls": 0.02, "tti": 3100.0},
            "reportHtml": "<html></html>"
        }"#;
        let report: SidecarReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.performance_score, Some(87.0));
        let metrics = report.metrics.unwrap();
        assert_eq!(metrics.lcp, Some(1900.0));
        assert_eq!(report.report_html.as_deref(), Some("<html></html>"));
    }

    #[test]
    fn test_client_requires_url() {
        assert!(PerfClient::from_config(&PerfConfig::default()).is_none());
        let config = PerfConfig {
            url: Some("http://perf:3001/".to_string()),
            ..Default::default()
        };
        let client = PerfClient::from_config(&config).unwrap();
        assert_eq!(client.base_url, "http://perf:3001");
    }
}
