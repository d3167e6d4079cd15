//! Core admission and job endpoints: submission, upload, status, cancel,
//! retry, artifacts, visual acceptance, stats and health.
//!
//! Submission flow per write endpoint: authenticate -> rate-limit ->
//! validate -> allocate session id -> status file (queued) -> state store
//! upsert (best-effort) -> queue push -> `{job_id, status: "queued"}`.
//! The relational store is best-effort on this path: the platform keeps
//! admitting jobs on status files alone when the database is down.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::queue::JobMessage;
use crate::state::{JobKind, SessionStatus};
use crate::status::StatusDoc;

use super::auth::ApiAuth;
use super::error::ApiError;
use super::models::{
    HealthResponse, JobEnqueueResponse, JobStatusResponse, MobileTestRequest, StatsResponse,
    UploadResponse, VisualAcceptRequest, VisualAcceptResponse, WebTestRequest,
};
use super::state::AppState;
use super::{utils, validation};

const UPLOAD_CHUNK_CAPACITY: usize = 1024 * 1024;

/// GET /: service descriptor
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "ProofBox TaaS API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            {"method": "POST", "path": "/api/test/web"},
            {"method": "POST", "path": "/api/test/mobile"},
            {"method": "POST", "path": "/api/upload/mobile"},
            {"method": "GET", "path": "/api/jobs/{job_id}"},
            {"method": "GET", "path": "/api/sessions"},
            {"method": "GET", "path": "/healthz"},
        ],
    }))
}

/// GET /healthz: component availability
pub async fn healthz(State(state): State<AppState>) -> Response {
    if let Err(err) = state.queue.health_check() {
        let body = HealthResponse {
            ok: false,
            queue: false,
            db: false,
            s3_configured: state.config.storage.configured(),
            error: Some(err.to_string()),
        };
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    }

    let db = state.state.ping().await.is_ok();
    let body = HealthResponse {
        ok: true,
        queue: true,
        db,
        s3_configured: state.config.storage.configured(),
        error: None,
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /api/stats: queue liveness counters
pub async fn stats(State(state): State<AppState>, _auth: ApiAuth) -> Result<Response, ApiError> {
    let counters = state.queue.counters()?;
    Ok(Json(StatsResponse {
        queue: state.queue.name().to_string(),
        counters,
    })
    .into_response())
}

/// POST /api/test/web
pub async fn submit_web(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(request): Json<WebTestRequest>,
) -> Result<Json<JobEnqueueResponse>, ApiError> {
    validation::validate_web(&request).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let payload = serde_json::to_value(&request)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let project = request.project.clone().or_else(|| request.site.clone());
    let job_id = enqueue_session(&state, JobKind::Web, &request.test_type, project, payload).await?;

    Ok(Json(JobEnqueueResponse {
        job_id,
        status: "queued".to_string(),
    }))
}

/// POST /api/test/mobile
pub async fn submit_mobile(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(request): Json<MobileTestRequest>,
) -> Result<Json<JobEnqueueResponse>, ApiError> {
    validation::validate_mobile(&request).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let payload = serde_json::to_value(&request)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let project = request.project.clone();
    let job_id =
        enqueue_session(&state, JobKind::Mobile, &request.test_type, project, payload).await?;

    Ok(Json(JobEnqueueResponse {
        job_id,
        status: "queued".to_string(),
    }))
}

async fn enqueue_session(
    state: &AppState,
    kind: JobKind,
    test_type: &str,
    project: Option<String>,
    payload: serde_json::Value,
) -> Result<String, ApiError> {
    let session_id = Uuid::new_v4();
    let job_id = session_id.simple().to_string();
    let kind_name = kind.to_string();

    state
        .status
        .write(&StatusDoc::queued(&job_id, &kind_name, payload.clone()))?;

    if let Err(err) = state
        .state
        .upsert_session(
            session_id,
            &kind_name,
            test_type,
            project.as_deref(),
            SessionStatus::Queued,
            &payload,
        )
        .await
    {
        warn!(job_id = %job_id, error = %err, "Session insert failed, continuing on status file");
    }

    state
        .broker
        .enqueue(JobMessage {
            kind,
            session_id: job_id.clone(),
            payload,
        })
        .await?;

    Ok(job_id)
}

/// POST /api/upload/mobile: streamed multipart upload
pub async fn upload_mobile(
    State(state): State<AppState>,
    _auth: ApiAuth,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let upload_dir = state
        .config
        .upload
        .resolve_dir(&state.config.server.results_dir);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| "upload.bin".to_string());
        let suffix = utils::file_suffix(&original_name);

        let allowed = state
            .config
            .upload
            .allowed_exts
            .iter()
            .any(|ext| suffix == format!(".{ext}"));
        if !allowed {
            let shown = if suffix.is_empty() { "unknown" } else { &suffix };
            return Err(ApiError::UnsupportedMedia(shown.to_string()));
        }

        let dest = upload_dir.join(format!("{}{}", Uuid::new_v4().simple(), suffix));
        let result = stream_to_file(&state, field, &dest).await;

        return match result {
            Ok(size) => Ok(Json(UploadResponse {
                path: dest.display().to_string(),
                filename: original_name,
                size,
            })),
            Err(err) => {
                // Never leave a partial file behind
                let _ = tokio::fs::remove_file(&dest).await;
                Err(err)
            }
        };
    }

    Err(ApiError::BadRequest("multipart field 'file' is required".to_string()))
}

async fn stream_to_file(
    state: &AppState,
    mut field: axum::extract::multipart::Field<'_>,
    dest: &std::path::Path,
) -> Result<u64, ApiError> {
    let max_bytes = state.config.upload.max_bytes();
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut total: u64 = 0;
    let mut buffered: usize = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        total += chunk.len() as u64;
        if max_bytes > 0 && total > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                ">{} MB",
                state.config.upload.max_mb
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        buffered += chunk.len();
        if buffered >= UPLOAD_CHUNK_CAPACITY {
            file.flush()
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            buffered = 0;
        }
    }

    file.flush()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(total)
}

/// GET /api/jobs/{job_id}: status file first, state store fallback
pub async fn get_job(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    if let Some(doc) = state.status.read(&job_id)? {
        return Ok(Json(JobStatusResponse {
            job_id: doc.job_id,
            status: doc.status.to_string(),
            kind: doc.kind,
            result_path: doc.result_path,
            error: doc.error,
            payload: (!doc.payload.is_null()).then_some(doc.payload),
            artifact_urls: doc.artifact_urls,
        }));
    }

    // The ephemeral status file can be lost across container restarts;
    // synthesize an equivalent view from the durable store
    let session_id = Uuid::parse_str(&job_id)
        .map_err(|_| ApiError::NotFound("Job not found".to_string()))?;
    let session = state
        .state
        .get_session(session_id)
        .await
        .ok()
        .flatten()
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;

    let artifact_urls = match state.state.latest_result(session_id).await {
        Ok(Some(row)) => serde_json::from_value(
            row.summary
                .get("artifact_urls")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
        .ok(),
        _ => None,
    };

    let result_path = state.status.result_path(&job_id);
    Ok(Json(JobStatusResponse {
        job_id,
        status: session.status.to_string(),
        kind: session.kind,
        result_path: result_path
            .is_file()
            .then(|| result_path.display().to_string()),
        error: None,
        payload: None,
        artifact_urls,
    }))
}

/// POST /api/jobs/{job_id}/cancel: cooperative cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.flags.set(&job_id)?;

    state.status.update(&job_id, |doc| {
        if !doc.status.is_terminal() {
            doc.status = SessionStatus::CancelRequested;
        }
    })?;

    if let Ok(session_id) = Uuid::parse_str(&job_id) {
        if let Err(err) = state
            .state
            .update_session_status(session_id, SessionStatus::CancelRequested)
            .await
        {
            warn!(job_id = %job_id, error = %err, "Session status update failed");
        }
    }

    Ok(Json(serde_json::json!({"ok": true})))
}

/// POST /api/jobs/{job_id}/retry: clone into a fresh session and re-queue
pub async fn retry_job(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(job_id): Path<String>,
) -> Result<Json<JobEnqueueResponse>, ApiError> {
    let (kind_name, test_type, project, payload) = match state.status.read(&job_id)? {
        Some(doc) => {
            let payload = doc.payload;
            let test_type = payload
                .get("test_type")
                .and_then(|v| v.as_str())
                .unwrap_or("smoke")
                .to_string();
            let project = payload
                .get("project")
                .or_else(|| payload.get("site"))
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            (doc.kind, test_type, project, payload)
        }
        None => {
            let session_id = Uuid::parse_str(&job_id)
                .map_err(|_| ApiError::NotFound("Job not found".to_string()))?;
            let session = state
                .state
                .get_session(session_id)
                .await
                .ok()
                .flatten()
                .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;
            (
                session.kind,
                session.test_type,
                session.project,
                session.payload.unwrap_or(serde_json::Value::Null),
            )
        }
    };

    let kind = kind_name.parse::<JobKind>().unwrap_or(JobKind::Web);
    let new_id = enqueue_session(&state, kind, &test_type, project, payload).await?;
    Ok(Json(JobEnqueueResponse {
        job_id: new_id,
        status: "queued".to_string(),
    }))
}

/// GET /api/job-results/{job_id}: raw result summary
pub async fn get_job_result(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .status
        .read_result(&job_id)?
        .ok_or_else(|| ApiError::NotFound("Result not found".to_string()))?;
    Ok(Json(summary))
}

/// GET /api/artifacts/{job_id}/{name}: 302 to a freshly signed URL.
/// Stored signatures are never replayed, so expiry never leaks to clients.
pub async fn get_artifact(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path((job_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let mut artifact = state
        .status
        .read(&job_id)?
        .and_then(|doc| doc.artifact_urls)
        .and_then(|mut arts| arts.remove(&name));

    if artifact.is_none() {
        if let Ok(session_id) = Uuid::parse_str(&job_id) {
            if let Ok(Some(row)) = state.state.latest_result(session_id).await {
                artifact = row
                    .summary
                    .get("artifact_urls")
                    .and_then(|arts| arts.get(&name))
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
            }
        }
    }

    let artifact = artifact.ok_or_else(|| ApiError::NotFound("Artifact not found".to_string()))?;

    if let Some(store) = &state.store {
        let ttl = std::time::Duration::from_secs(state.config.storage.artifact_ttl_secs);
        if let Ok(url) = store.presign(&artifact.key, ttl).await {
            return Ok(redirect(&url));
        }
    }
    if let Some(url) = artifact.presigned_url {
        return Ok(redirect(&url));
    }

    Err(ApiError::NotFound("Artifact not found".to_string()))
}

fn redirect(url: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
}

/// POST /api/visual/accept: promote a stored screenshot to the baseline
pub async fn visual_accept(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(request): Json<VisualAcceptRequest>,
) -> Result<Json<VisualAcceptResponse>, ApiError> {
    let job_id = request.session_id.trim().to_string();
    if job_id.is_empty() {
        return Err(ApiError::BadRequest("session_id required".to_string()));
    }
    let index = request.index.max(1);

    let summary = state
        .status
        .read_result(&job_id)?
        .ok_or_else(|| ApiError::NotFound("Result not found".to_string()))?;

    let url = summary
        .get("cases")
        .and_then(|cases| cases.as_array())
        .and_then(|cases| cases.get(index - 1))
        .and_then(|case| case.get("url"))
        .or_else(|| summary.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("case-{index}"));

    let project = match request.project.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(project) => project.to_string(),
        None => state
            .status
            .read(&job_id)?
            .map(|doc| doc.payload)
            .and_then(|payload| {
                payload
                    .get("project")
                    .or_else(|| payload.get("site"))
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "default".to_string()),
    };

    let mut screenshot = state.status.dir().join(format!("{job_id}-{index}-screenshot.png"));
    if !screenshot.is_file() {
        screenshot = state.status.dir().join(format!("{job_id}-screenshot.png"));
    }
    if !screenshot.is_file() {
        return Err(ApiError::NotFound("screenshot not found".to_string()));
    }
    let bytes = tokio::fs::read(&screenshot)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    // A case marker without a recorded URL still yields a stable slug
    let slug_source = if url.starts_with("http") {
        url.clone()
    } else {
        format!("https://unknown.invalid/{url}")
    };

    let baseline_key = state
        .visual
        .promote_baseline(&project, &slug_source, bytes)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let store = state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::Internal("S3 not configured".to_string()))?;
    let ttl = std::time::Duration::from_secs(state.config.storage.artifact_ttl_secs);
    let signed = store.presign(&baseline_key, ttl).await?;

    Ok(Json(VisualAcceptResponse {
        ok: true,
        baseline_key,
        url: signed,
    }))
}
