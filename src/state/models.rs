use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job kind: which executor family handles the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Web,
    Mobile,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Web => write!(f, "web"),
            JobKind::Mobile => write!(f, "mobile"),
        }
    }
}

impl FromStr for JobKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(JobKind::Web),
            "mobile" => Ok(JobKind::Mobile),
            _ => Err(()),
        }
    }
}

/// Session lifecycle state.
///
/// Monotonic along: queued -> {cancel_requested} -> {running|canceled}
/// -> {completed|failed|canceled}. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    CancelRequested,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Canceled => "canceled",
            SessionStatus::CancelRequested => "cancel_requested",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SessionStatus::Queued),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "canceled" => Ok(SessionStatus::Canceled),
            "cancel_requested" => Ok(SessionStatus::CancelRequested),
            _ => Err(()),
        }
    }
}

/// Session ids travel as 32-char lowercase hex at the API boundary
pub mod uuid_simple {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.simple().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Uuid::parse_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// One row of `test_sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(with = "uuid_simple")]
    pub id: Uuid,
    pub project: Option<String>,
    pub kind: String,
    pub test_type: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// One row of `test_results` (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: i64,
    #[serde(with = "uuid_simple")]
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub summary: serde_json::Value,
}

/// One row of `api_keys`; the raw key is never part of this record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub project: Option<String>,
    pub rate_limit_per_min: i32,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Aggregate per-project session count
#[derive(Debug, Clone, Serialize)]
pub struct ProjectCount {
    pub project: Option<String>,
    pub sessions: i64,
}

/// Filters accepted by `list_sessions`
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub test_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}
