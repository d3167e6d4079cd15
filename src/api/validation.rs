use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{MobileTestRequest, WebTestRequest};

pub const WEB_TEST_TYPES: &[&str] = &["smoke", "full", "performance", "security", "auto"];
pub const MOBILE_TEST_TYPES: &[&str] = &["analyze", "e2e"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("test_type must be one of {expected}, got '{got}'")]
    UnknownTestType { expected: String, got: String },
    #[error("url must be an http(s) URL")]
    InvalidUrl,
    #[error("web request requires a url or a site")]
    MissingWebTarget,
    #[error("mobile request requires an apk/ipa path or URL, or a deep_link")]
    MissingMobileInput,
    #[error("invalid timestamp '{0}' (expected RFC 3339)")]
    BadTimestamp(String),
    #[error("limit must be between 1 and 200")]
    BadLimit,
    #[error("offset must be >= 0")]
    BadOffset,
}

pub fn validate_web(request: &WebTestRequest) -> Result<(), ValidationError> {
    validate_test_type(&request.test_type, WEB_TEST_TYPES)?;

    if let Some(url) = &request.url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidUrl);
        }
    }

    // Routes resolve against a base; a bare routes list has no anchor
    if request.url.is_none() && request.site.is_none() {
        return Err(ValidationError::MissingWebTarget);
    }

    Ok(())
}

pub fn validate_mobile(request: &MobileTestRequest) -> Result<(), ValidationError> {
    validate_test_type(&request.test_type, MOBILE_TEST_TYPES)?;

    let has_input = request.apk_path.is_some()
        || request.ipa_path.is_some()
        || request.apk_url.is_some()
        || request.ipa_url.is_some()
        || request.deep_link.is_some();
    if !has_input {
        return Err(ValidationError::MissingMobileInput);
    }

    Ok(())
}

fn validate_test_type(test_type: &str, allowed: &[&str]) -> Result<(), ValidationError> {
    if allowed.contains(&test_type) {
        Ok(())
    } else {
        Err(ValidationError::UnknownTestType {
            expected: allowed.join("|"),
            got: test_type.to_string(),
        })
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::BadTimestamp(raw.to_string()))
}

/// Clamp-check paging: limit 1..=200 (default 50), offset >= 0 (default 0)
pub fn validate_paging(
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<(i64, i64), ValidationError> {
    let limit = limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(ValidationError::BadLimit);
    }
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(ValidationError::BadOffset);
    }
    Ok((limit, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web(json: &str) -> WebTestRequest {
        serde_json::from_str(json).unwrap()
    }

    fn mobile(json: &str) -> MobileTestRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn validate_web_accepts_url_and_site_forms() {
        assert!(validate_web(&web(r#"{"url": "https://x.test/"}"#)).is_ok());
        assert!(validate_web(&web(r#"{"site": "shop", "test_type": "full"}"#)).is_ok());
        assert!(validate_web(&web(r#"{"url": "https://x.test", "routes": ["/a"]}"#)).is_ok());
    }

    #[test]
    fn validate_web_rejects_unknown_test_type() {
        let err = validate_web(&web(r#"{"url": "https://x.test/", "test_type": "chaos"}"#))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTestType { .. }));
    }

    #[test]
    fn validate_web_rejects_missing_target() {
        let err = validate_web(&web(r#"{"routes": ["/a"]}"#)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingWebTarget));
    }

    #[test]
    fn validate_web_rejects_non_http_url() {
        let err = validate_web(&web(r#"{"url": "ftp://x.test/"}"#)).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidUrl));
    }

    #[test]
    fn validate_mobile_requires_input() {
        assert!(validate_mobile(&mobile(r#"{"apk_path": "/tmp/a.apk"}"#)).is_ok());
        assert!(validate_mobile(&mobile(r#"{"deep_link": "app://home"}"#)).is_ok());
        let err = validate_mobile(&mobile(r#"{}"#)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingMobileInput));
    }

    #[test]
    fn validate_mobile_rejects_web_test_type() {
        let err =
            validate_mobile(&mobile(r#"{"apk_path": "/a.apk", "test_type": "smoke"}"#)).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTestType { .. }));
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2026-08-01T10:00:00Z").is_ok());
        assert!(parse_timestamp("2026-08-01T10:00:00+07:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_validate_paging() {
        assert_eq!(validate_paging(None, None).unwrap(), (50, 0));
        assert_eq!(validate_paging(Some(200), Some(10)).unwrap(), (200, 10));
        assert!(matches!(
            validate_paging(Some(0), None).unwrap_err(),
            ValidationError::BadLimit
        ));
        assert!(matches!(
            validate_paging(Some(201), None).unwrap_err(),
            ValidationError::BadLimit
        ));
        assert!(matches!(
            validate_paging(None, Some(-1)).unwrap_err(),
            ValidationError::BadOffset
        ));
    }
}
