//! Request authentication extractors.
//!
//! Client auth accepts the `X-API-Key` header or the `api_key` query
//! parameter. The legacy global key (config `server.api_key`) authenticates
//! without touching the database and bypasses the per-key rate limiter;
//! database-backed keys are verified by hash and counted against their
//! per-minute window. Admin endpoints use an independent `X-Admin-Token`
//! header, never the client key.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::state::ApiKeyRecord;

use super::error::ApiError;
use super::state::AppState;

/// Proof of client authentication; `key` is None for the legacy global key
pub struct ApiAuth {
    pub key: Option<ApiKeyRecord>,
}

impl FromRequestParts<AppState> for ApiAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let provided = header_value(parts, "x-api-key")
            .or_else(|| query_param(parts, "api_key"))
            .unwrap_or_default();

        if provided.is_empty() {
            return Err(ApiError::Unauthorized("Invalid API key".to_string()));
        }

        if let Some(global) = &state.config.server.api_key {
            if &provided == global {
                return Ok(ApiAuth { key: None });
            }
        }

        // A degraded database reads as an unknown key, like any other miss
        let record = match state.state.verify_api_key(&provided).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "API key lookup failed");
                None
            }
        };
        let record =
            record.ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))?;

        if !state.limiter.check(record.id, record.rate_limit_per_min) {
            return Err(ApiError::RateLimited);
        }

        Ok(ApiAuth { key: Some(record) })
    }
}

/// Proof of admin authentication
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let provided = header_value(parts, "x-admin-token");
        let expected = state.config.server.admin_token.as_deref();

        match (expected, provided) {
            (Some(expected), Some(provided)) if !expected.is_empty() && provided == expected => {
                Ok(AdminAuth)
            }
            _ => Err(ApiError::Unauthorized("Invalid admin token".to_string())),
        }
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .filter(|v| !v.is_empty())
}

fn query_param(parts: &Parts, name: &str) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.is_empty())
}
