//! Pure helpers for HTTP request/response processing.
//!
//! Extracted from the handlers so they can be unit tested without a router.

/// Pull the security alert list out of a result summary. Accepts both the
/// result-row shape (`{summary: {security: {alerts}}}`) and a bare summary.
pub fn extract_alerts(value: &serde_json::Value) -> Vec<serde_json::Value> {
    let security = value
        .get("summary")
        .and_then(|s| s.get("security"))
        .or_else(|| value.get("security"));

    security
        .and_then(|sec| sec.get("alerts"))
        .and_then(|alerts| alerts.as_array())
        .cloned()
        .unwrap_or_default()
}

const ALERT_CSV_COLUMNS: &[&str] = &["risk", "alert", "url", "evidence"];

/// Render alerts as CSV with RFC 4180 quoting: every field quoted, embedded
/// quotes doubled
pub fn alerts_csv(alerts: &[serde_json::Value]) -> String {
    let mut lines = vec![ALERT_CSV_COLUMNS.join(",")];

    for alert in alerts {
        let fields: Vec<String> = ALERT_CSV_COLUMNS
            .iter()
            .map(|col| csv_escape(alert.get(*col)))
            .collect();
        lines.push(fields.join(","));
    }

    lines.join("\n") + "\n"
}

fn csv_escape(value: Option<&serde_json::Value>) -> String {
    let raw = match value {
        None | Some(serde_json::Value::Null) => return String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    format!("\"{}\"", raw.replace('"', "\"\""))
}

/// Extension (with leading dot, lowercased) of an uploaded filename
pub fn file_suffix(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}
