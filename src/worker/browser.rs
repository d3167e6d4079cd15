//! Browser automation seam.
//!
//! The platform never embeds a browser. Navigation, screenshotting, tracing
//! and selector probing are one opaque capability behind [`BrowserDriver`];
//! the production implementation talks to an automation sidecar over HTTP
//! (`BROWSER_URL`). The sidecar owns the browser context per visit and
//! guarantees the trace is finalized on every path, including navigation
//! failures.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Driver unavailable: {0}")]
    Unavailable(String),

    #[error("Bad driver response: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, BrowserError>;

/// One page visit: navigate, settle, capture
#[derive(Debug, Clone)]
pub struct VisitRequest {
    pub url: String,
    pub viewport: (u32, u32),
    /// CSS selectors to count matches for after the page settles
    pub selectors: Vec<String>,
    pub trace: bool,
    pub timeout: Duration,
}

/// Everything captured for one visit
#[derive(Debug, Clone, Default)]
pub struct VisitOutcome {
    pub status: Option<u16>,
    pub title: Option<String>,
    pub screenshot_png: Option<Vec<u8>>,
    pub trace_zip: Option<Vec<u8>>,
    pub selector_hits: BTreeMap<String, u64>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn visit(&self, request: &VisitRequest) -> Result<VisitOutcome>;
}

#[derive(Serialize)]
struct SidecarVisitRequest<'a> {
    url: &'a str,
    viewport: SidecarViewport,
    wait_until: &'static str,
    timeout_ms: u64,
    full_page_screenshot: bool,
    trace: bool,
    selectors: &'a [String],
}

#[derive(Serialize)]
struct SidecarViewport {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct SidecarVisitResponse {
    status: Option<u16>,
    title: Option<String>,
    screenshot_b64: Option<String>,
    trace_b64: Option<String>,
    #[serde(default)]
    selector_hits: BTreeMap<String, u64>,
}

/// HTTP client for the browser automation sidecar
pub struct SidecarDriver {
    base_url: String,
    client: reqwest::Client,
}

impl SidecarDriver {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BrowserDriver for SidecarDriver {
    async fn visit(&self, request: &VisitRequest) -> Result<VisitOutcome> {
        let body = SidecarVisitRequest {
            url: &request.url,
            viewport: SidecarViewport {
                width: request.viewport.0,
                height: request.viewport.1,
            },
            wait_until: "networkidle",
            timeout_ms: request.timeout.as_millis() as u64,
            full_page_screenshot: true,
            trace: request.trace,
            selectors: &request.selectors,
        };

        let response = self
            .client
            .post(format!("{}/visit", self.base_url))
            .json(&body)
            // Navigation timeout plus slack for capture/trace transfer
            .timeout(request.timeout + Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| BrowserError::Unavailable(e.to_string()))?;

        if response.status().as_u16() >= 400 {
            return Err(BrowserError::NavigationFailed(format!(
                "driver_status_{}",
                response.status().as_u16()
            )));
        }

        let payload: SidecarVisitResponse = response
            .json()
            .await
            .map_err(|e| BrowserError::BadResponse(e.to_string()))?;

        let decode = |b64: Option<String>| -> Result<Option<Vec<u8>>> {
            b64.map(|raw| {
                base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|e| BrowserError::BadResponse(e.to_string()))
            })
            .transpose()
        };

        Ok(VisitOutcome {
            status: payload.status,
            title: payload.title,
            screenshot_png: decode(payload.screenshot_b64)?,
            trace_zip: decode(payload.trace_b64)?,
            selector_hits: payload.selector_hits,
        })
    }
}

/// Scripted driver for tests. Exposed publicly so integration suites can
/// drive the worker without a browser sidecar.
#[derive(Default)]
pub struct ScriptedDriver {
    pages: std::sync::Mutex<std::collections::HashMap<String, ScriptedPage>>,
    visits: std::sync::Mutex<Vec<String>>,
    on_visit: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct ScriptedPage {
    pub status: u16,
    pub title: String,
    pub screenshot_png: Option<Vec<u8>>,
    pub selector_hits: BTreeMap<String, u64>,
    pub error: Option<String>,
}

impl Default for ScriptedPage {
    fn default() -> Self {
        Self {
            status: 200,
            title: "Scripted Page".to_string(),
            screenshot_png: None,
            selector_hits: BTreeMap::new(),
            error: None,
        }
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, page: ScriptedPage) -> Self {
        self.set_page(url, page);
        self
    }

    /// Replace a page mid-test (e.g. re-render with a pixel changed)
    pub fn set_page(&self, url: &str, page: ScriptedPage) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    /// Invoked with the URL at the start of every visit; lets tests flip
    /// cancel flags mid-job deterministically
    pub fn with_visit_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_visit = Some(Box::new(hook));
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn visit(&self, request: &VisitRequest) -> Result<VisitOutcome> {
        if let Some(hook) = &self.on_visit {
            hook(&request.url);
        }
        self.visits.lock().unwrap().push(request.url.clone());

        let page = self
            .pages
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_default();

        if let Some(error) = page.error {
            return Err(BrowserError::NavigationFailed(error));
        }

        let mut selector_hits = BTreeMap::new();
        for selector in &request.selectors {
            let hits = page.selector_hits.get(selector).copied().unwrap_or(0);
            selector_hits.insert(selector.clone(), hits);
        }

        Ok(VisitOutcome {
            status: Some(page.status),
            title: Some(page.title),
            screenshot_png: page.screenshot_png,
            trace_zip: request.trace.then(|| b"PK\x03\x04scripted-trace".to_vec()),
            selector_hits,
        })
    }
}
