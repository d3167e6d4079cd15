//! Per-job lifecycle: cancel check, idempotency skip, executor dispatch,
//! result persistence, notification, queue acknowledgement.
//!
//! Nothing here propagates errors upward. Every delivery ends in a terminal
//! queue state, and every job that actually ran ends in a terminal session
//! status; persistence failures degrade to warnings while the status file
//! keeps the authoritative view.

use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::policy::RiskCounts;
use crate::queue::{JobEnvelope, MessageState};
use crate::state::{JobKind, SessionStatus};
use crate::status::ArtifactRef;

use super::{mobile, web, CancelToken, ExecError, WorkerEnv};

/// What the runner needs from an executor, regardless of kind
struct JobOutput {
    summary: serde_json::Value,
    passed: bool,
    test_type: String,
    perf_score: Option<f64>,
    risk_counts: Option<RiskCounts>,
    artifact_urls: BTreeMap<String, ArtifactRef>,
}

/// Process one delivered job envelope to a terminal state
pub async fn process(env: &WorkerEnv, envelope: JobEnvelope) {
    let JobEnvelope { seq, message } = envelope;
    let job_id = message.session_id.clone();
    let session_uuid = Uuid::parse_str(&job_id).ok();

    if let Err(err) = env.queue.mark(seq, MessageState::Started) {
        warn!(seq, job_id = %job_id, error = %err, "Failed to mark job started");
    }

    let cancel = CancelToken::new(env, &job_id);

    // Canceled before any work started
    if cancel.is_canceled() {
        finish_canceled(env, &job_id, session_uuid, &BTreeMap::new()).await;
        ack(env, seq, MessageState::Finished);
        return;
    }

    // At-least-once redelivery: a session that already reached a terminal
    // state is not run again
    if let Some(uuid) = session_uuid {
        if let Ok(Some(session)) = env.state.get_session(uuid).await {
            if session.status.is_terminal() {
                info!(job_id = %job_id, status = %session.status, "Session already terminal, skipping");
                ack(env, seq, MessageState::Finished);
                return;
            }
        }
    }

    info!(seq, job_id = %job_id, kind = %message.kind, "Job started");

    if let Err(err) = env.status.update(&job_id, |doc| {
        doc.status = SessionStatus::Running;
        doc.kind = message.kind.to_string();
        if doc.payload.is_null() {
            doc.payload = message.payload.clone();
        }
    }) {
        warn!(job_id = %job_id, error = %err, "Status file update failed");
    }
    if let Some(uuid) = session_uuid {
        if let Err(err) = env.state.update_session_status(uuid, SessionStatus::Running).await {
            warn!(job_id = %job_id, error = %err, "Session status update failed");
        }
    }

    let mut artifacts: BTreeMap<String, ArtifactRef> = BTreeMap::new();
    let outcome = dispatch(env, &job_id, message.kind, &message.payload, &cancel, &mut artifacts).await;

    match outcome {
        Err(ExecError::Canceled) => {
            info!(job_id = %job_id, "Job canceled at suspension point");
            finish_canceled(env, &job_id, session_uuid, &artifacts).await;
            ack(env, seq, MessageState::Finished);
        }
        Ok(output) => {
            let final_status = if output.passed {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };

            let result_path = match env.status.write_result(&job_id, &output.summary) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "Result mirror write failed");
                    None
                }
            };

            if let Err(err) = env.status.update(&job_id, |doc| {
                doc.status = final_status;
                doc.result_path = result_path.clone();
                if !output.artifact_urls.is_empty() {
                    doc.artifact_urls = Some(output.artifact_urls.clone());
                }
            }) {
                warn!(job_id = %job_id, error = %err, "Status file update failed");
            }

            if let Some(uuid) = session_uuid {
                if let Err(err) = env.state.update_session_status(uuid, final_status).await {
                    warn!(job_id = %job_id, error = %err, "Session status update failed");
                }
                if let Err(err) = env.state.append_result(uuid, &output.summary).await {
                    warn!(job_id = %job_id, error = %err, "Result row insert failed");
                }
            }

            env.notifier
                .notify(&crate::notify::JobDigest {
                    job_id: job_id.clone(),
                    test_type: output.test_type.clone(),
                    status: final_status.to_string(),
                    perf_score: output.perf_score,
                    risk_counts: output.risk_counts.clone(),
                    artifact_urls: output.artifact_urls.clone(),
                })
                .await;

            info!(seq, job_id = %job_id, status = %final_status, "Job finished");
            let queue_state = if output.passed {
                MessageState::Finished
            } else {
                MessageState::Failed
            };
            ack(env, seq, queue_state);
        }
    }
}

async fn dispatch(
    env: &WorkerEnv,
    job_id: &str,
    kind: JobKind,
    payload: &serde_json::Value,
    cancel: &CancelToken,
    artifacts: &mut BTreeMap<String, ArtifactRef>,
) -> Result<JobOutput, ExecError> {
    match kind {
        JobKind::Mobile => {
            let payload: mobile::MobilePayload = match serde_json::from_value(payload.clone()) {
                Ok(payload) => payload,
                Err(err) => return Ok(malformed_payload_output("mobile", &err.to_string())),
            };
            let summary = mobile::execute(env, job_id, &payload, cancel).await?;
            if let Some(map) = &summary.artifact_urls {
                artifacts.extend(map.clone());
            }
            Ok(JobOutput {
                passed: summary.passed,
                test_type: summary.test_type.clone(),
                perf_score: None,
                risk_counts: None,
                artifact_urls: artifacts.clone(),
                summary: serde_json::to_value(&summary).unwrap_or_default(),
            })
        }
        JobKind::Web => {
            let payload: web::WebPayload = match serde_json::from_value(payload.clone()) {
                Ok(payload) => payload,
                Err(err) => return Ok(malformed_payload_output("web", &err.to_string())),
            };
            let summary = web::execute(env, job_id, &payload, cancel, artifacts).await?;
            Ok(JobOutput {
                passed: summary.passed,
                test_type: summary.test_type.clone(),
                perf_score: summary
                    .performance
                    .as_ref()
                    .and_then(|p| p.performance_score),
                risk_counts: summary.security.as_ref().and_then(|s| s.counts.clone()),
                artifact_urls: artifacts.clone(),
                summary: serde_json::to_value(&summary).unwrap_or_default(),
            })
        }
    }
}

/// A payload that does not deserialize is a failed job, not a crashed worker.
/// Admission validates payloads, so this only fires on corrupted queue data.
fn malformed_payload_output(kind: &str, error: &str) -> JobOutput {
    JobOutput {
        summary: serde_json::json!({
            "test_type": "unknown",
            "passed": false,
            "error": format!("malformed {kind} payload: {error}"),
        }),
        passed: false,
        test_type: "unknown".to_string(),
        perf_score: None,
        risk_counts: None,
        artifact_urls: BTreeMap::new(),
    }
}

async fn finish_canceled(
    env: &WorkerEnv,
    job_id: &str,
    session_uuid: Option<Uuid>,
    artifacts: &BTreeMap<String, ArtifactRef>,
) {
    if let Err(err) = env.status.update(job_id, |doc| {
        doc.status = SessionStatus::Canceled;
        doc.error = Some("canceled".to_string());
        if !artifacts.is_empty() {
            doc.artifact_urls = Some(artifacts.clone());
        }
    }) {
        warn!(job_id = %job_id, error = %err, "Status file update failed");
    }
    if let Some(uuid) = session_uuid {
        if let Err(err) = env
            .state
            .update_session_status(uuid, SessionStatus::Canceled)
            .await
        {
            warn!(job_id = %job_id, error = %err, "Session status update failed");
        }
    }
}

fn ack(env: &WorkerEnv, seq: u64, state: MessageState) {
    if let Err(err) = env.queue.mark(seq, state) {
        warn!(seq, error = %err, "Failed to mark job delivery state");
    }
}
