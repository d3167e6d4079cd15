//! Completion webhook.
//!
//! Best-effort by contract: a failed or slow webhook never changes a job's
//! outcome, so every error path ends in a warn log and nothing else.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::policy::RiskCounts;
use crate::status::ArtifactRef;

/// At most this many artifact links go into a digest
const MAX_ARTIFACT_LINKS: usize = 4;

/// What gets posted about a finished job
#[derive(Debug, Clone)]
pub struct JobDigest {
    pub job_id: String,
    pub test_type: String,
    pub status: String,
    pub perf_score: Option<f64>,
    pub risk_counts: Option<RiskCounts>,
    pub artifact_urls: BTreeMap<String, ArtifactRef>,
}

#[derive(Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn notify(&self, digest: &JobDigest) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let payload = serde_json::json!({ "text": render_text(digest) });
        let result = self
            .client
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        if let Err(err) = result {
            tracing::warn!(job_id = %digest.job_id, error = %err, "Webhook notification failed");
        }
    }
}

fn render_text(digest: &JobDigest) -> String {
    let mut lines = vec![
        format!(
            "TaaS {} {}",
            digest.test_type.to_uppercase(),
            digest.status.to_uppercase()
        ),
        format!("job: {}", digest.job_id),
        format!("type: {}", digest.test_type),
        format!("status: {}", digest.status),
    ];

    if let Some(score) = digest.perf_score {
        lines.push(format!("perf: {score}"));
    }
    if let Some(counts) = &digest.risk_counts {
        lines.push(format!(
            "zap: H{}/M{}/L{}",
            counts.high, counts.medium, counts.low
        ));
    }
    for (name, artifact) in digest.artifact_urls.iter().take(MAX_ARTIFACT_LINKS) {
        if let Some(url) = &artifact.presigned_url {
            lines.push(format!("{name}: {url}"));
        }
    }

    lines.join("\n")
}
