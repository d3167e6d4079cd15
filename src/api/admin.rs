//! API-key administration. Gated by the admin token, never by client keys.
//! The raw key material is returned exactly once, at creation; only its hash
//! is ever persisted.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use super::auth::AdminAuth;
use super::error::ApiError;
use super::models::{CreateKeyRequest, UpdateKeyRequest};
use super::state::AppState;

/// GET /api/admin/keys
pub async fn list_keys(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Result<Response, ApiError> {
    let items = state.state.list_api_keys(100).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

/// POST /api/admin/keys
pub async fn create_key(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, ApiError> {
    let name = request.name.unwrap_or_else(|| "token".to_string());
    let rate = request.rate_limit_per_min.unwrap_or(60);

    // 256 bits of key material, hex encoded
    let raw = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );

    let record = state
        .state
        .insert_api_key(&name, request.project.as_deref(), &raw, rate)
        .await?;

    let mut body = serde_json::to_value(&record).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["api_key"] = serde_json::Value::String(raw);
    Ok(Json(body).into_response())
}

/// PATCH /api/admin/keys/{key_id}
pub async fn update_key(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(key_id): Path<i64>,
    Json(request): Json<UpdateKeyRequest>,
) -> Result<Response, ApiError> {
    let updated = state
        .state
        .update_api_key(key_id, request.active, request.rate_limit_per_min)
        .await?
        .ok_or_else(|| ApiError::NotFound("Key not found".to_string()))?;
    Ok(Json(updated).into_response())
}
