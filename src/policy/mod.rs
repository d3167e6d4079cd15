//! Pass/fail policy over heterogeneous signals.
//!
//! The evaluator is a pure function of measured values and configured
//! thresholds. Every failure emits a machine-readable reason string
//! (`score<80`, `lcp>2500`, `high>0`, ...) so CI consumers can audit the
//! verdict without re-deriving it.

use serde::{Deserialize, Serialize};

use crate::config::{PerfConfig, ZapConfig};

/// Performance metrics extracted from the Lighthouse sidecar report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcp_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tti_ms: Option<f64>,
}

/// Alert counts by risk, as reported by the security scanner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskCounts {
    #[serde(rename = "High", default)]
    pub high: u32,
    #[serde(rename = "Medium", default)]
    pub medium: u32,
    #[serde(rename = "Low", default)]
    pub low: u32,
    #[serde(rename = "Informational", default)]
    pub informational: u32,
}

/// Policy verdict carried in every result summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReport {
    pub performance_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_reasons: Option<Vec<String>>,
    pub security_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_reasons: Option<Vec<String>>,
}

impl PolicyReport {
    pub fn passing() -> Self {
        Self {
            performance_ok: true,
            performance_reasons: None,
            security_ok: true,
            security_reasons: None,
        }
    }
}

/// Evaluate performance signals against thresholds.
/// Absent metrics are not judged; only measured values can fail.
pub fn evaluate_performance(
    thresholds: &PerfConfig,
    score: Option<f64>,
    metrics: &PerfMetrics,
) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if let Some(score) = score {
        if score < thresholds.score_min {
            reasons.push(format!("score<{}", format_threshold(thresholds.score_min)));
        }
    }
    if let Some(lcp) = metrics.lcp_ms {
        if lcp > thresholds.lcp_max_ms {
            reasons.push(format!("lcp>{}", format_threshold(thresholds.lcp_max_ms)));
        }
    }
    if let Some(cls) = metrics.cls {
        if cls > thresholds.cls_max {
            reasons.push(format!("cls>{}", format_threshold(thresholds.cls_max)));
        }
    }
    if let Some(tti) = metrics.tti_ms {
        if tti > thresholds.tti_max_ms {
            reasons.push(format!("tti>{}", format_threshold(thresholds.tti_max_ms)));
        }
    }

    (reasons.is_empty(), reasons)
}

/// Evaluate security alert counts against allowances
pub fn evaluate_security(thresholds: &ZapConfig, counts: &RiskCounts) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if counts.high > thresholds.allow_high {
        reasons.push(format!("high>{}", thresholds.allow_high));
    }
    if counts.medium > thresholds.allow_medium {
        reasons.push(format!("medium>{}", thresholds.allow_medium));
    }

    (reasons.is_empty(), reasons)
}

/// Overall verdict: every case passed, and each dimension that actually ran
/// is ok. Dimensions that did not run (None) cannot fail the job.
pub fn overall_pass(all_cases_passed: bool, perf_ok: Option<bool>, security_ok: Option<bool>) -> bool {
    all_cases_passed && perf_ok.unwrap_or(true) && security_ok.unwrap_or(true)
}

/// Render thresholds the way operators configured them: integral values
/// without a trailing ".0" (score<80, cls>0.1)
fn format_threshold(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
