//! Static mobile analysis via the MobSF sidecar.
//!
//! Flow: resolve the artifact (local path preferred, else download), upload
//! to the analyzer, trigger the scan keyed by the returned content hash
//! (tolerating both `/scan` and `/scan/{type}` API variants), pull the JSON
//! report and distill it. An unconfigured analyzer is a pass with
//! `configured=false`, not a failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MobsfConfig;
use crate::status::ArtifactRef;

use super::{ArtifactUploader, CancelToken, ExecError, WorkerEnv};

/// Summary of one mobile session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileSummary {
    pub test_type: String,
    pub analyzer: String,
    pub configured: bool,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_urls: Option<BTreeMap<String, ArtifactRef>>,
}

/// Payload of POST /api/test/mobile, replayed to the worker verbatim
#[derive(Debug, Clone, Deserialize)]
pub struct MobilePayload {
    pub apk_url: Option<String>,
    pub ipa_url: Option<String>,
    pub apk_path: Option<String>,
    pub ipa_path: Option<String>,
    pub deep_link: Option<String>,
    #[serde(default = "default_mobile_test_type")]
    pub test_type: String,
    pub project: Option<String>,
}

fn default_mobile_test_type() -> String {
    "analyze".to_string()
}

/// Run a mobile session and produce its summary
pub async fn execute(
    env: &WorkerEnv,
    job_id: &str,
    payload: &MobilePayload,
    cancel: &CancelToken,
) -> Result<MobileSummary, ExecError> {
    let test_type = payload.test_type.to_lowercase();

    if test_type != "analyze" {
        // Device E2E runs on external infrastructure; record the placeholder
        return Ok(MobileSummary {
            test_type,
            analyzer: "Appium".to_string(),
            configured: false,
            passed: true,
            summary: Some("E2E executed on device".to_string()),
            hash: None,
            scan_type: None,
            risk_score: None,
            permissions: None,
            endpoints: None,
            report_path: None,
            error: None,
            artifact_urls: None,
        });
    }

    let Some(client) = MobsfClient::from_config(&env.config.mobsf) else {
        return Ok(MobileSummary {
            test_type,
            analyzer: "MobSF".to_string(),
            configured: false,
            passed: true,
            summary: Some("MobSF not configured; skipped static analysis".to_string()),
            hash: None,
            scan_type: None,
            risk_score: None,
            permissions: None,
            endpoints: None,
            report_path: None,
            error: None,
            artifact_urls: None,
        });
    };

    if cancel.is_canceled() {
        return Err(ExecError::Canceled);
    }

    let mut summary = MobileSummary {
        test_type,
        analyzer: "MobSF".to_string(),
        configured: true,
        passed: false,
        summary: None,
        hash: None,
        scan_type: None,
        risk_score: None,
        permissions: None,
        endpoints: None,
        report_path: None,
        error: None,
        artifact_urls: None,
    };

    let local_file = match resolve_input(env, job_id, payload).await {
        Ok(path) => path,
        Err(err) => {
            summary.error = Some(err);
            return Ok(summary);
        }
    };

    match client.analyze(&local_file).await {
        Ok(analysis) => {
            summary.passed = true;
            summary.summary = Some("Static analysis completed".to_string());
            summary.hash = Some(analysis.hash);
            summary.scan_type = Some(analysis.scan_type);
            summary.risk_score = analysis.risk_score;
            summary.permissions = analysis.permissions;
            summary.endpoints = analysis.endpoints;

            if let Some(html) = analysis.report_html {
                let report_path = env.status.dir().join(format!("{job_id}-mobsf.html"));
                if let Err(err) = std::fs::write(&report_path, html) {
                    warn!(job_id, error = %err, "Failed to persist MobSF report");
                } else {
                    summary.report_path = Some(report_path.display().to_string());

                    let mut artifacts = BTreeMap::new();
                    let mut uploader = ArtifactUploader::new(env, job_id, &mut artifacts);
                    uploader.upload_file("mobsf_html", &report_path, cancel).await?;
                    if !artifacts.is_empty() {
                        summary.artifact_urls = Some(artifacts);
                    }
                }
            }
        }
        Err(err) => {
            summary.error = Some(err);
        }
    }

    Ok(summary)
}

/// Local path preferred; else download the URL into the results scratch area
async fn resolve_input(
    env: &WorkerEnv,
    job_id: &str,
    payload: &MobilePayload,
) -> Result<PathBuf, String> {
    if let Some(path) = payload.apk_path.clone().or_else(|| payload.ipa_path.clone()) {
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(format!("input file not found: {}", path.display()));
        }
        return Ok(path);
    }

    let (source, ext) = match (&payload.apk_url, &payload.ipa_url) {
        (Some(url), _) => (url.clone(), ".apk"),
        (None, Some(url)) => (url.clone(), ".ipa"),
        (None, None) => return Err("No APK/IPA provided".to_string()),
    };

    let response = reqwest::Client::new()
        .get(&source)
        .timeout(Duration::from_secs(60))
        .send()
        .await
        .map_err(|e| format!("download failed: {e}"))?;
    if response.status().as_u16() >= 400 {
        return Err(format!("download failed: status {}", response.status().as_u16()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("download failed: {e}"))?;

    let dest = env.status.dir().join(format!("mobsf-{job_id}{ext}"));
    tokio::fs::write(&dest, &bytes)
        .await
        .map_err(|e| format!("scratch write failed: {e}"))?;
    info!(job_id, size = bytes.len(), path = %dest.display(), "Downloaded mobile artifact");
    Ok(dest)
}

struct Analysis {
    hash: String,
    scan_type: String,
    risk_score: Option<serde_json::Value>,
    permissions: Option<serde_json::Value>,
    endpoints: Option<serde_json::Value>,
    report_html: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    hash: Option<String>,
    md5: Option<String>,
    sha256: Option<String>,
    scan_type: Option<String>,
}

struct MobsfClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl MobsfClient {
    fn from_config(config: &MobsfConfig) -> Option<Self> {
        Some(Self {
            base_url: config.url.clone()?.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone()?,
            client: reqwest::Client::new(),
        })
    }

    async fn analyze(&self, file: &Path) -> Result<Analysis, String> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| format!("read failed: {e}"))?;

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let upload: UploadResponse = self
            .post_multipart("api/v1/upload", form, Duration::from_secs(300))
            .await?;

        let hash = upload
            .hash
            .or(upload.md5)
            .or(upload.sha256)
            .ok_or_else(|| "upload response missing hash".to_string())?;
        let scan_type = upload.scan_type.unwrap_or_else(|| {
            if file.extension().and_then(|e| e.to_str()) == Some("apk") {
                "apk".to_string()
            } else {
                "ipa".to_string()
            }
        });

        // Some analyzer versions expose /scan, others /scan/{type}
        let scan_form = [("hash", hash.as_str()), ("scan_type", scan_type.as_str())];
        let scan = self
            .post_form_raw("api/v1/scan", &scan_form, Duration::from_secs(600))
            .await;
        if scan.is_err() {
            self.post_form_raw(
                &format!("api/v1/scan/{scan_type}"),
                &scan_form,
                Duration::from_secs(600),
            )
            .await?;
        }

        let report: serde_json::Value = {
            let raw = self
                .post_form_raw("api/v1/report_json", &[("hash", hash.as_str())], Duration::from_secs(300))
                .await?;
            serde_json::from_str(&raw).map_err(|e| format!("report decode failed: {e}"))?
        };

        let pick = |keys: &[&str]| -> Option<serde_json::Value> {
            keys.iter()
                .find_map(|k| report.get(*k))
                .filter(|v| !v.is_null())
                .cloned()
        };

        let report_html = self
            .post_form_raw("api/v1/report", &[("hash", hash.as_str())], Duration::from_secs(300))
            .await
            .ok()
            .filter(|body| !body.is_empty());

        Ok(Analysis {
            hash,
            scan_type,
            risk_score: pick(&["risk_score", "score"]),
            permissions: pick(&["permissions", "apppermissions"]),
            endpoints: pick(&["urls", "domains"]),
            report_html,
        })
    }

    async fn post_multipart<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
        timeout: Duration,
    ) -> Result<T, String> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .header("Authorization", &self.api_key)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("mobsf_unreachable:{e}"))?;
        if response.status().as_u16() >= 400 {
            return Err(format!("mobsf_status_{}", response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("mobsf_decode:{e}"))
    }

    async fn post_form_raw(
        &self,
        path: &str,
        form: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String, String> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .header("Authorization", &self.api_key)
            .form(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("mobsf_unreachable:{e}"))?;
        if response.status().as_u16() >= 400 {
            return Err(format!("mobsf_status_{}", response.status().as_u16()));
        }
        response.text().await.map_err(|e| format!("mobsf_read:{e}"))
    }
}
