//! Wire models for the admission API.
//!
//! Submissions come in as typed request structs, get validated against the
//! test-type enumerations, and are replayed verbatim to the worker as the
//! session payload. Responses mirror the shapes dashboards and CI already
//! consume: `{job_id, status}` on submission, the status document on reads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::queue::QueueCounters;
use crate::status::ArtifactRef;

/// Body of POST /api/test/web
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebTestRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_web_test_type")]
    pub test_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

fn default_web_test_type() -> String {
    "smoke".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default = "default_is_emulator")]
    pub is_emulator: bool,
}

fn default_platform() -> String {
    "android".to_string()
}

fn default_is_emulator() -> bool {
    true
}

/// Body of POST /api/test/mobile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileTestRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apk_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipa_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apk_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipa_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_link: Option<String>,
    #[serde(default = "default_mobile_test_type")]
    pub test_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<MobileDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

fn default_mobile_test_type() -> String {
    "analyze".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobEnqueueResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_urls: Option<BTreeMap<String, ArtifactRef>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub path: String,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub queue: bool,
    pub db: bool,
    pub s3_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: String,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

/// Body of POST /api/visual/accept
#[derive(Debug, Deserialize)]
pub struct VisualAcceptRequest {
    #[serde(alias = "job_id")]
    pub session_id: String,
    #[serde(default = "default_case_index")]
    pub index: usize,
    pub project: Option<String>,
}

fn default_case_index() -> usize {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VisualAcceptResponse {
    pub ok: bool,
    pub baseline_key: String,
    pub url: String,
}

/// Query string of GET /api/sessions
#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub project: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub test_type: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

/// Query string for plain paged listings
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Paged listing envelope
#[derive(Debug, Serialize)]
pub struct ItemsPage<T: Serialize> {
    pub items: Vec<T>,
    pub limit: i64,
    pub offset: i64,
}

/// Body of POST /api/admin/keys
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: Option<String>,
    pub project: Option<String>,
    pub rate_limit_per_min: Option<i32>,
}

/// Body of PATCH /api/admin/keys/{id}
#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub active: Option<bool>,
    pub rate_limit_per_min: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}
