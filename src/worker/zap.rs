//! ZAP security scanner client.
//!
//! The scanner is an opaque HTTP API: spider scan + status polling, an
//! ajax-spider pass for SPAs, alert retrieval and an HTML report. Polling
//! rechecks the cancel token between iterations and between stages; a cancel
//! surfaces as [`ExecError::Canceled`] so the worker can transition the job.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ZapConfig;
use crate::policy::RiskCounts;

use super::{CancelToken, ExecError};

/// Alerts kept in a summary; the full set is available from the scanner
const MAX_ALERTS: usize = 50;

/// Always-excluded alert URL patterns (framework chunk noise)
const BUILTIN_EXCLUDES: &[&str] = &[r"/_next/static/"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZapAlert {
    pub risk: String,
    pub alert: Option<String>,
    pub url: Option<String>,
    pub evidence: Option<String>,
}

/// Security section of a result summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZapReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<RiskCounts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<ZapAlert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct SpiderScanResponse {
    scan: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Deserialize)]
struct AlertsResponse {
    #[serde(default)]
    alerts: Vec<RawAlert>,
}

#[derive(Deserialize)]
struct RawAlert {
    risk: Option<String>,
    riskdesc: Option<String>,
    alert: Option<String>,
    url: Option<String>,
    evidence: Option<String>,
}

pub struct ZapClient {
    base_url: String,
    api_key: String,
    max_seconds: u64,
    excludes: Vec<Regex>,
    client: reqwest::Client,
}

impl ZapClient {
    pub fn from_config(config: &ZapConfig) -> Option<Self> {
        let base_url = config.url.clone()?.trim_end_matches('/').to_string();

        let mut patterns: Vec<&str> = BUILTIN_EXCLUDES.to_vec();
        let extra = config.exclude_regex.clone().unwrap_or_default();
        patterns.extend(extra.split(',').map(str::trim).filter(|p| !p.is_empty()));
        let excludes = patterns
            .into_iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = p, error = %err, "Skipping invalid ZAP exclude");
                    None
                }
            })
            .collect();

        Some(Self {
            base_url,
            api_key: config.api_key.clone().unwrap_or_default(),
            max_seconds: config.max_seconds,
            excludes,
            client: reqwest::Client::new(),
        })
    }

    /// Spider + ajax-spider + passive alert collection against one target.
    /// Scanner failures produce an error report, not a job failure.
    pub async fn run(
        &self,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<(ZapReport, Option<String>), ExecError> {
        match self.run_inner(target, cancel).await {
            Ok(value) => Ok(value),
            Err(ScanError::Canceled) => Err(ExecError::Canceled),
            Err(ScanError::Upstream(message)) => Ok((
                ZapReport {
                    error: Some(message),
                    ..Default::default()
                },
                None,
            )),
        }
    }

    async fn run_inner(
        &self,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<(ZapReport, Option<String>), ScanError> {
        let deadline = Instant::now() + Duration::from_secs(self.max_seconds);

        // Spider stage
        let scan: SpiderScanResponse = self
            .get_json("JSON/spider/action/scan/", &[("url", target)])
            .await?;
        debug!(target, scan_id = %scan.scan, "ZAP spider started");

        loop {
            if cancel.is_canceled() {
                return Err(ScanError::Canceled);
            }
            let status: StatusResponse = self
                .get_json("JSON/spider/view/status/", &[("scanId", scan.scan.as_str())])
                .await?;
            if status.status.parse::<u32>().unwrap_or(0) >= 100 {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if cancel.is_canceled() {
            return Err(ScanError::Canceled);
        }

        // Ajax-spider stage for SPAs; failures here are non-fatal
        let ajax_cap = Duration::from_secs(self.max_seconds.min(60));
        if self
            .get_raw("JSON/ajaxSpider/action/scan/", &[("url", target)])
            .await
            .is_ok()
        {
            let ajax_deadline = Instant::now() + ajax_cap;
            loop {
                if cancel.is_canceled() {
                    return Err(ScanError::Canceled);
                }
                match self
                    .get_json::<StatusResponse>("JSON/ajaxSpider/view/status/", &[])
                    .await
                {
                    Ok(status) if status.status == "stopped" => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
                if Instant::now() >= ajax_deadline || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        // Passive scanning trails the spiders; give it a moment
        tokio::time::sleep(Duration::from_secs(2)).await;

        if cancel.is_canceled() {
            return Err(ScanError::Canceled);
        }

        let alerts: AlertsResponse = self
            .get_json("JSON/core/view/alerts/", &[("baseurl", target)])
            .await?;

        let mut counts = RiskCounts::default();
        let mut items = Vec::new();
        for raw in alerts.alerts {
            let risk = raw
                .risk
                .or_else(|| {
                    raw.riskdesc
                        .as_deref()
                        .and_then(|d| d.split(' ').next())
                        .map(String::from)
                })
                .unwrap_or_default();
            let url = raw.url.unwrap_or_default();
            if self.excluded(&url) {
                continue;
            }
            match risk.as_str() {
                "High" => counts.high += 1,
                "Medium" => counts.medium += 1,
                "Low" => counts.low += 1,
                "Informational" => counts.informational += 1,
                _ => {}
            }
            items.push(ZapAlert {
                risk,
                alert: raw.alert,
                url: Some(url),
                evidence: raw.evidence,
            });
        }
        items.truncate(MAX_ALERTS);

        let html = self
            .get_raw("OTHER/core/other/htmlreport/", &[])
            .await
            .ok()
            .filter(|body| !body.is_empty());

        Ok((
            ZapReport {
                counts: Some(counts),
                alerts: items,
                report_path: None,
                error: None,
            },
            html,
        ))
    }

    fn excluded(&self, url: &str) -> bool {
        self.excludes.iter().any(|re| re.is_match(url))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ScanError> {
        let body = self.get_raw(path, params).await?;
        serde_json::from_str(&body).map_err(|e| ScanError::Upstream(format!("zap_decode:{e}")))
    }

    async fn get_raw(&self, path: &str, params: &[(&str, &str)]) -> Result<String, ScanError> {
        let mut query: Vec<(&str, &str)> = params.to_vec();
        if !self.api_key.is_empty() {
            query.push(("apikey", self.api_key.as_str()));
        }
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(&query)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ScanError::Upstream(format!("zap_unreachable:{e}")))?;

        if response.status().as_u16() >= 400 {
            return Err(ScanError::Upstream(format!(
                "zap_status_{}",
                response.status().as_u16()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ScanError::Upstream(format!("zap_read:{e}")))
    }
}

enum ScanError {
    Canceled,
    Upstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_excludes(extra: Option<&str>) -> ZapClient {
        ZapClient::from_config(&ZapConfig {
            url: Some("http://zap:8090".to_string()),
            exclude_regex: extra.map(String::from),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_builtin_exclude() {
        let client = client_with_excludes(None);
        assert!(client.excluded("https://x.test/_next/static/chunk.js"));
        assert!(!client.excluded("https://x.test/login"));
    }

    #[test]
    fn test_env_excludes_append() {
        let client = client_with_excludes(Some(r"/healthz, /metrics"));
        assert!(client.excluded("https://x.test/healthz"));
        assert!(client.excluded("https://x.test/metrics"));
        assert!(client.excluded("https://x.test/_next/static/a.js"));
        assert!(!client.excluded("https://x.test/store"));
    }

    #[test]
    fn test_alert_risk_from_riskdesc() {
        let raw: RawAlert = serde_json::from_str(
            r#"{"riskdesc": "Medium (Confidence High)", "alert": "X-Frame-Options", "url": "https://x.test/"}"#,
        )
        .unwrap();
        let risk = raw
            .risk
            .or_else(|| {
                raw.riskdesc
                    .as_deref()
                    .and_then(|d| d.split(' ').next())
                    .map(String::from)
            })
            .unwrap();
        assert_eq!(risk, "Medium");
    }

    #[test]
    fn test_report_serialization_skips_empties() {
        let report = ZapReport::default();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
