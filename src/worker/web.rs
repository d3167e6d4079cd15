//! Web test executor.
//!
//! Resolves the target URL set (explicit routes, site config, single URL or
//! auto-crawl), drives the browser for each, applies selector assertions and
//! the visual baseline check, optionally runs the performance and security
//! sidecars, uploads artifacts and assembles the result summary.
//!
//! Cancellation is rechecked before every browser visit, before the sidecar
//! calls and before each artifact upload; artifacts uploaded before a cancel
//! stay referenced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::policy::{self, PolicyReport};
use crate::sites::{self, SiteConfig};
use crate::status::ArtifactRef;
use crate::visual::{VisualOutcome, VIEWPORT};

use super::browser::VisitRequest;
use super::crawl::{Crawler, DEFAULT_MAX_PAGES};
use super::perf::PerfReport;
use super::zap::ZapReport;
use super::{ArtifactUploader, CancelToken, ExecError, WorkerEnv};

/// Payload of POST /api/test/web, replayed to the worker verbatim
#[derive(Debug, Clone, Deserialize)]
pub struct WebPayload {
    pub url: Option<String>,
    #[serde(default = "default_web_test_type")]
    pub test_type: String,
    pub site: Option<String>,
    pub routes: Option<Vec<String>>,
    pub project: Option<String>,
}

fn default_web_test_type() -> String {
    "smoke".to_string()
}

impl WebPayload {
    /// Baseline namespace: project, else site, else "default"
    pub fn project_name(&self) -> String {
        self.project
            .clone()
            .or_else(|| self.site.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// One URL's evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub url: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_selectors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual: Option<VisualOutcome>,
}

/// Result summary for a web session. Single-URL runs keep the flat legacy
/// shape (url/status_code/title at the top level); multi-URL runs nest the
/// per-case records under `cases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSummary {
    pub test_type: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_selectors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual: Option<VisualOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cases: Option<Vec<CaseResult>>,
    pub duration_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerfReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<ZapReport>,
    pub policy: PolicyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_urls: Option<BTreeMap<String, ArtifactRef>>,
}

/// A resolved target: the route key ties a URL back to its site-config
/// assertions; crawled and single-URL targets have none
#[derive(Debug, Clone)]
struct Target {
    route: Option<String>,
    url: String,
}

/// Run a web session. Artifact references accumulate in `artifacts` so the
/// caller keeps whatever was uploaded even when the job is canceled.
pub async fn execute(
    env: &WorkerEnv,
    job_id: &str,
    payload: &WebPayload,
    cancel: &CancelToken,
    artifacts: &mut BTreeMap<String, ArtifactRef>,
) -> Result<WebSummary, ExecError> {
    let started = Instant::now();
    let test_type = payload.test_type.to_lowercase();

    let site_config = payload
        .site
        .as_deref()
        .and_then(|site| sites::load_site(&env.config.server.sites_dir, site));

    let targets = resolve_targets(payload, site_config.as_ref(), &test_type).await;
    if targets.is_empty() {
        return Ok(WebSummary {
            test_type,
            passed: false,
            url: payload.url.clone(),
            status_code: None,
            title: None,
            screenshot: None,
            trace: None,
            error: Some("no target urls resolved".to_string()),
            missing_selectors: None,
            visual: None,
            cases: None,
            duration_sec: round2(started.elapsed().as_secs_f64()),
            performance: None,
            security: None,
            policy: PolicyReport::passing(),
            artifact_urls: None,
        });
    }

    let project = payload.project_name();
    let timeout = Duration::from_secs(env.config.browser.navigation_timeout_secs);

    let single = targets.len() == 1;
    let mut cases: Vec<CaseResult> = Vec::with_capacity(targets.len());
    let mut all_passed = true;

    for (idx, target) in targets.iter().enumerate() {
        // Suspension point: before launching the browser for this URL
        if cancel.is_canceled() {
            return Err(ExecError::Canceled);
        }

        let selectors: Vec<String> = target
            .route
            .as_deref()
            .and_then(|route| site_config.as_ref().map(|cfg| cfg.selectors_for(route)))
            .map(|s| s.to_vec())
            .unwrap_or_default();

        let case = run_case(env, job_id, idx + 1, &project, target, selectors, timeout, cancel).await;
        if !case.passed {
            all_passed = false;
        }

        // Stream this case's artifacts out right away so a later cancel
        // still leaves them uploaded and referenced
        upload_case_artifacts(env, job_id, idx + 1, single, &case, cancel, artifacts).await?;
        cases.push(case);
    }

    let duration_sec = round2(started.elapsed().as_secs_f64());
    let first_url = targets[0].url.clone();

    // Performance dimension, only for performance runs
    let mut performance: Option<PerfReport> = None;
    let mut perf_verdict: Option<(bool, Vec<String>)> = None;
    if test_type == "performance" {
        if cancel.is_canceled() {
            return Err(ExecError::Canceled);
        }
        let (mut report, html) = match &env.perf {
            Some(client) => client.run(&first_url).await,
            None => (
                PerfReport {
                    error: Some("perf sidecar not configured".to_string()),
                    ..Default::default()
                },
                None,
            ),
        };
        if let Some(html) = html {
            let path = env.status.dir().join(format!("{job_id}-perf.html"));
            if std::fs::write(&path, html).is_ok() {
                report.report_path = Some(path.display().to_string());
            }
        }
        perf_verdict = Some(if report.error.is_some() {
            (false, vec!["lighthouse_unavailable".to_string()])
        } else {
            let metrics = report.metrics.clone().unwrap_or_default();
            policy::evaluate_performance(&env.config.perf, report.performance_score, &metrics)
        });
        performance = Some(report);
    }

    // Security dimension, only for security runs
    let mut security: Option<ZapReport> = None;
    let mut security_verdict: Option<(bool, Vec<String>)> = None;
    if test_type == "security" {
        if cancel.is_canceled() {
            return Err(ExecError::Canceled);
        }
        let (mut report, html) = match &env.zap {
            Some(client) => client.run(&first_url, cancel).await?,
            None => (
                ZapReport {
                    error: Some("zap scanner not configured".to_string()),
                    ..Default::default()
                },
                None,
            ),
        };
        if let Some(html) = html {
            let path = env.status.dir().join(format!("{job_id}-zap.html"));
            if std::fs::write(&path, html).is_ok() {
                report.report_path = Some(path.display().to_string());
            }
        }
        security_verdict = Some(if report.error.is_some() {
            (false, vec!["zap_unavailable".to_string()])
        } else {
            let counts = report.counts.clone().unwrap_or_default();
            policy::evaluate_security(&env.config.zap, &counts)
        });
        security = Some(report);
    }

    // Sidecar report artifacts (suspension point before each upload)
    {
        let mut uploader = ArtifactUploader::new(env, job_id, artifacts);
        if let Some(path) = performance.as_ref().and_then(|p| p.report_path.as_ref()) {
            uploader.upload_file("perf_html", &PathBuf::from(path), cancel).await?;
        }
        if let Some(path) = security.as_ref().and_then(|s| s.report_path.as_ref()) {
            uploader.upload_file("zap_html", &PathBuf::from(path), cancel).await?;
        }
    }

    let (performance_ok, performance_reasons) = split_verdict(perf_verdict.clone());
    let (security_ok, security_reasons) = split_verdict(security_verdict.clone());
    let passed = policy::overall_pass(
        all_passed,
        perf_verdict.map(|(ok, _)| ok),
        security_verdict.map(|(ok, _)| ok),
    );

    let report = PolicyReport {
        performance_ok,
        performance_reasons,
        security_ok,
        security_reasons,
    };

    info!(job_id, test_type = %test_type, cases = cases.len(), passed, "Web run finished");

    Ok(assemble_summary(
        test_type,
        passed,
        cases,
        duration_sec,
        performance,
        security,
        report,
        artifacts.clone(),
    ))
}

/// URL resolution precedence: explicit routes > site config > single url,
/// with auto runs replaced by a crawl when it discovers anything.
async fn resolve_targets(
    payload: &WebPayload,
    site_config: Option<&SiteConfig>,
    test_type: &str,
) -> Vec<Target> {
    let base_from_site = site_config.and_then(|cfg| cfg.base_url.clone());

    let mut targets: Vec<Target> = if let Some(routes) = payload.routes.as_ref().filter(|r| !r.is_empty()) {
        let base = base_from_site.clone().or_else(|| payload.url.clone());
        let urls = sites::to_abs_urls(base.as_deref(), routes);
        routes
            .iter()
            .zip(urls)
            .map(|(route, url)| Target {
                route: Some(route.clone()),
                url,
            })
            .collect()
    } else if let Some(cfg) = site_config {
        let routes = cfg.route_list();
        let urls = sites::to_abs_urls(cfg.base_url.as_deref(), &routes);
        routes
            .into_iter()
            .zip(urls)
            .map(|(route, url)| Target {
                route: Some(route),
                url,
            })
            .collect()
    } else if let Some(url) = &payload.url {
        vec![Target {
            route: None,
            url: url.clone(),
        }]
    } else {
        Vec::new()
    };

    if test_type == "auto" {
        let seed = payload.url.clone().or(base_from_site);
        if let Some(seed) = seed {
            let discovered = Crawler::new(DEFAULT_MAX_PAGES).crawl(&seed).await;
            if !discovered.is_empty() {
                targets = discovered
                    .into_iter()
                    .map(|url| Target { route: None, url })
                    .collect();
            } else if targets.is_empty() {
                targets = vec![Target {
                    route: None,
                    url: seed,
                }];
            }
        }
    }

    targets
}

#[allow(clippy::too_many_arguments)]
async fn run_case(
    env: &WorkerEnv,
    job_id: &str,
    n: usize,
    project: &str,
    target: &Target,
    selectors: Vec<String>,
    timeout: Duration,
    _cancel: &CancelToken,
) -> CaseResult {
    let request = VisitRequest {
        url: target.url.clone(),
        viewport: VIEWPORT,
        selectors: selectors.clone(),
        trace: true,
        timeout,
    };

    let outcome = match env.driver.visit(&request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            return CaseResult {
                url: target.url.clone(),
                passed: false,
                status_code: None,
                title: None,
                screenshot: None,
                trace: None,
                error: Some(err.to_string()),
                missing_selectors: None,
                visual: None,
            };
        }
    };

    let status_ok = outcome
        .status
        .is_some_and(|code| (200..400).contains(&code));

    let missing: Vec<String> = selectors
        .iter()
        .filter(|sel| outcome.selector_hits.get(*sel).copied().unwrap_or(0) == 0)
        .cloned()
        .collect();

    // Persist captures next to the status documents
    let screenshot_path = env.status.dir().join(format!("{job_id}-{n}-screenshot.png"));
    let screenshot = match &outcome.screenshot_png {
        Some(bytes) if std::fs::write(&screenshot_path, bytes).is_ok() => {
            Some(screenshot_path.display().to_string())
        }
        _ => None,
    };

    let trace_path = env.status.dir().join(format!("{job_id}-{n}-trace.zip"));
    let trace = match &outcome.trace_zip {
        Some(bytes) if std::fs::write(&trace_path, bytes).is_ok() => {
            Some(trace_path.display().to_string())
        }
        _ => None,
    };

    // Visual baseline check; engine errors degrade to "no visual verdict"
    let visual = match &outcome.screenshot_png {
        Some(png) => match env.visual.compare(project, &target.url, png).await {
            Ok(check) => {
                let mut outcome = check.outcome;
                if let Some(diff_png) = check.diff_png {
                    let diff_path = env
                        .status
                        .dir()
                        .join(format!("{job_id}-{n}-visual-diff.png"));
                    if std::fs::write(&diff_path, diff_png).is_ok() {
                        outcome.diff_image = Some(diff_path.display().to_string());
                    }
                }
                Some(outcome)
            }
            Err(err) => {
                warn!(job_id, url = %target.url, error = %err, "Visual comparison failed");
                None
            }
        },
        None => None,
    };

    let visual_ok = visual.as_ref().map(|v| v.passed).unwrap_or(true);
    let passed = status_ok && missing.is_empty() && visual_ok;

    CaseResult {
        url: target.url.clone(),
        passed,
        status_code: outcome.status,
        title: outcome.title,
        screenshot,
        trace,
        error: None,
        missing_selectors: (!missing.is_empty()).then_some(missing),
        visual,
    }
}

async fn upload_case_artifacts(
    env: &WorkerEnv,
    job_id: &str,
    n: usize,
    single: bool,
    case: &CaseResult,
    cancel: &CancelToken,
    artifacts: &mut BTreeMap<String, ArtifactRef>,
) -> Result<(), ExecError> {
    let mut uploader = ArtifactUploader::new(env, job_id, artifacts);
    let suffix = |base: &str| {
        if single {
            base.to_string()
        } else {
            format!("{base}_{n}")
        }
    };

    if let Some(screenshot) = &case.screenshot {
        uploader
            .upload_file(&suffix("screenshot"), &PathBuf::from(screenshot), cancel)
            .await?;
    }
    if let Some(trace) = &case.trace {
        uploader
            .upload_file(&suffix("trace"), &PathBuf::from(trace), cancel)
            .await?;
    }
    if let Some(diff) = case.visual.as_ref().and_then(|v| v.diff_image.as_ref()) {
        uploader
            .upload_file(&suffix("visual_diff"), &PathBuf::from(diff), cancel)
            .await?;
    }
    Ok(())
}

fn split_verdict(verdict: Option<(bool, Vec<String>)>) -> (bool, Option<Vec<String>>) {
    match verdict {
        Some((ok, reasons)) => (ok, (!reasons.is_empty()).then_some(reasons)),
        None => (true, None),
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble_summary(
    test_type: String,
    passed: bool,
    mut cases: Vec<CaseResult>,
    duration_sec: f64,
    performance: Option<PerfReport>,
    security: Option<ZapReport>,
    policy: PolicyReport,
    artifacts: BTreeMap<String, ArtifactRef>,
) -> WebSummary {
    let artifact_urls = (!artifacts.is_empty()).then_some(artifacts);

    if cases.len() == 1 {
        let case = cases.remove(0);
        WebSummary {
            test_type,
            passed,
            url: Some(case.url),
            status_code: case.status_code,
            title: case.title,
            screenshot: case.screenshot,
            trace: case.trace,
            error: case.error,
            missing_selectors: case.missing_selectors,
            visual: case.visual,
            cases: None,
            duration_sec,
            performance,
            security,
            policy,
            artifact_urls,
        }
    } else {
        WebSummary {
            test_type,
            passed,
            url: None,
            status_code: None,
            title: None,
            screenshot: None,
            trace: None,
            error: None,
            missing_selectors: None,
            visual: None,
            cases: Some(cases),
            duration_sec,
            performance,
            security,
            policy,
            artifact_urls,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_project_fallbacks() {
        let payload: WebPayload =
            serde_json::from_str(r#"{"url": "https://x.test/", "site": "shop"}"#).unwrap();
        assert_eq!(payload.project_name(), "shop");
        assert_eq!(payload.test_type, "smoke");

        let payload: WebPayload =
            serde_json::from_str(r#"{"url": "https://x.test/", "project": "p1"}"#).unwrap();
        assert_eq!(payload.project_name(), "p1");

        let payload: WebPayload = serde_json::from_str(r#"{"url": "https://x.test/"}"#).unwrap();
        assert_eq!(payload.project_name(), "default");
    }

    #[tokio::test]
    async fn test_resolve_single_url() {
        let payload: WebPayload = serde_json::from_str(r#"{"url": "https://x.test/"}"#).unwrap();
        let targets = resolve_targets(&payload, None, "smoke").await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].url, "https://x.test/");
        assert!(targets[0].route.is_none());
    }

    #[tokio::test]
    async fn test_resolve_routes_against_request_url() {
        let payload: WebPayload = serde_json::from_str(
            r#"{"url": "https://x.test", "routes": ["/cart", "/store"]}"#,
        )
        .unwrap();
        let targets = resolve_targets(&payload, None, "smoke").await;
        let urls: Vec<&str> = targets.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, vec!["https://x.test/cart", "https://x.test/store"]);
        assert_eq!(targets[0].route.as_deref(), Some("/cart"));
    }

    #[tokio::test]
    async fn test_resolve_site_routes_public_then_protected() {
        let site: SiteConfig = toml::from_str(
            r#"
base_url = "https://shop.test"

[routes]
public = ["/", "/store"]
protected = ["/account"]
            "#,
        )
        .unwrap();
        let payload: WebPayload = serde_json::from_str(r#"{"site": "shop"}"#).unwrap();
        let targets = resolve_targets(&payload, Some(&site), "full").await;
        let urls: Vec<&str> = targets.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://shop.test/",
                "https://shop.test/store",
                "https://shop.test/account",
            ]
        );
    }

    #[test]
    fn test_single_case_summary_is_flat() {
        let case = CaseResult {
            url: "https://x.test/".to_string(),
            passed: true,
            status_code: Some(200),
            title: Some("Home".to_string()),
            screenshot: Some("/tmp/a.png".to_string()),
            trace: None,
            error: None,
            missing_selectors: None,
            visual: None,
        };
        let summary = assemble_summary(
            "smoke".to_string(),
            true,
            vec![case],
            1.25,
            None,
            None,
            PolicyReport::passing(),
            BTreeMap::new(),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["url"], "https://x.test/");
        assert_eq!(json["status_code"], 200);
        assert!(json.get("cases").is_none());
        assert_eq!(json["duration_sec"], 1.25);
    }

    #[test]
    fn test_multi_case_summary_nests_cases() {
        let case = |url: &str| CaseResult {
            url: url.to_string(),
            passed: true,
            status_code: Some(200),
            title: None,
            screenshot: None,
            trace: None,
            error: None,
            missing_selectors: None,
            visual: None,
        };
        let summary = assemble_summary(
            "full".to_string(),
            true,
            vec![case("https://x.test/a"), case("https://x.test/b")],
            3.0,
            None,
            None,
            PolicyReport::passing(),
            BTreeMap::new(),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("url").is_none());
        assert_eq!(json["cases"].as_array().unwrap().len(), 2);
    }
}
