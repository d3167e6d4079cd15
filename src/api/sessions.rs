//! Dashboard read surface: session listings, results, projects, alert
//! exports. These endpoints read exclusively from the relational store, so a
//! degraded database surfaces as 500 here while the job path keeps working.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::state::SessionFilter;

use super::auth::ApiAuth;
use super::error::ApiError;
use super::models::{ItemsPage, PageQuery, SessionsQuery};
use super::state::AppState;
use super::{utils, validation};

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Query(query): Query<SessionsQuery>,
) -> Result<Response, ApiError> {
    let (limit, offset) = validation::validate_paging(query.limit, query.offset)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let since = query
        .since
        .as_deref()
        .map(validation::parse_timestamp)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let until = query
        .until
        .as_deref()
        .map(validation::parse_timestamp)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = SessionFilter {
        project: query.project,
        kind: query.kind,
        status: query.status,
        test_type: query.test_type,
        since,
        until,
    };

    let items = state.state.list_sessions(&filter, limit, offset).await?;
    Ok(Json(ItemsPage {
        items,
        limit,
        offset,
    })
    .into_response())
}

/// GET /api/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&session_id)?;
    let session = state
        .state
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;
    let latest_result = state.state.latest_result(id).await.unwrap_or(None);

    Ok(Json(serde_json::json!({
        "session": session,
        "latest_result": latest_result,
    }))
    .into_response())
}

/// GET /api/sessions/{session_id}/results
pub async fn list_session_results(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(session_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&session_id)?;
    let (limit, offset) = validation::validate_paging(query.limit, query.offset)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let items = state.state.list_results(id, limit, offset).await?;
    Ok(Json(ItemsPage {
        items,
        limit,
        offset,
    })
    .into_response())
}

/// GET /api/results/{result_id}
pub async fn get_result(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(result_id): Path<i64>,
) -> Result<Response, ApiError> {
    let row = state
        .state
        .get_result(result_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Not found".to_string()))?;
    Ok(Json(row).into_response())
}

/// GET /api/results/{result_id}/alerts.json
pub async fn result_alerts_json(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(result_id): Path<i64>,
) -> Result<Response, ApiError> {
    let row = state
        .state
        .get_result(result_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Not found".to_string()))?;
    let alerts = utils::extract_alerts(&serde_json::to_value(&row).unwrap_or_default());

    Ok(Json(serde_json::json!({
        "result_id": result_id,
        "count": alerts.len(),
        "alerts": alerts,
    }))
    .into_response())
}

/// GET /api/results/{result_id}/alerts.csv
pub async fn result_alerts_csv(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(result_id): Path<i64>,
) -> Result<Response, ApiError> {
    let row = state
        .state
        .get_result(result_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Not found".to_string()))?;
    let alerts = utils::extract_alerts(&serde_json::to_value(&row).unwrap_or_default());
    Ok(csv_response(utils::alerts_csv(&alerts)))
}

/// GET /api/sessions/{session_id}/alerts.json: latest result alerts
pub async fn session_alerts_json(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&session_id)?;
    let row = state
        .state
        .latest_result(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No results".to_string()))?;
    let alerts = utils::extract_alerts(&serde_json::to_value(&row).unwrap_or_default());

    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "result_id": row.id,
        "count": alerts.len(),
        "alerts": alerts,
    }))
    .into_response())
}

/// GET /api/sessions/{session_id}/alerts.csv
pub async fn session_alerts_csv(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&session_id)?;
    let row = state
        .state
        .latest_result(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No results".to_string()))?;
    let alerts = utils::extract_alerts(&serde_json::to_value(&row).unwrap_or_default());
    Ok(csv_response(utils::alerts_csv(&alerts)))
}

/// GET /api/projects: aggregate session counts
pub async fn list_projects(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Response, ApiError> {
    let items = state.state.list_projects().await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("Session not found".to_string()))
}

fn csv_response(csv: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv")],
        csv,
    )
        .into_response()
}
