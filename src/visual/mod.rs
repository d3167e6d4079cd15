//! Visual regression against stored baselines.
//!
//! Baselines are keyed by project, URL path slug and viewport:
//! `baselines/{project}/{slug}_{WxH}.png`. Comparison is a true per-pixel
//! check across all RGBA channels; `mismatch_pct` is the share of
//! non-identical pixels (0..100, three decimals). A diff image (per-channel
//! absolute difference) is produced whenever any pixel differs.

use image::{imageops, ImageFormat, ImageReader, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

use crate::storage::ObjectStore;

/// Viewport every web case renders at
pub const VIEWPORT: (u32, u32) = (1366, 900);

#[derive(Debug, Error)]
pub enum VisualError {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

pub type Result<T> = std::result::Result<T, VisualError>;

/// Per-case visual verdict carried in the result summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualOutcome {
    pub baseline_key: String,
    pub baseline_missing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch_pct: Option<f64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_image: Option<String>,
}

/// Outcome plus the diff image bytes for the caller to persist
pub struct VisualCheck {
    pub outcome: VisualOutcome,
    pub diff_png: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct VisualEngine {
    store: Option<Arc<dyn ObjectStore>>,
    threshold_pct: f64,
    auto_baseline: bool,
}

impl VisualEngine {
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        threshold_pct: f64,
        auto_baseline: bool,
    ) -> Self {
        Self {
            store,
            threshold_pct,
            auto_baseline,
        }
    }

    /// Compare a captured screenshot against the stored baseline for its URL.
    /// Missing baseline: auto-baseline mode promotes the screenshot and the
    /// case passes; otherwise the case passes with `baseline_missing` set.
    pub async fn compare(&self, project: &str, url: &str, screenshot_png: &[u8]) -> Result<VisualCheck> {
        let key = baseline_key(project, url, VIEWPORT);

        let baseline = match &self.store {
            Some(store) => store.get(&key).await?,
            None => None,
        };

        let Some(baseline_png) = baseline else {
            if self.auto_baseline {
                if let Some(store) = &self.store {
                    store.put(&key, screenshot_png.to_vec()).await?;
                    tracing::info!(key = %key, "Auto-promoted screenshot to baseline");
                }
            }
            return Ok(VisualCheck {
                outcome: VisualOutcome {
                    baseline_key: key,
                    baseline_missing: true,
                    mismatch_pct: None,
                    passed: true,
                    diff_image: None,
                },
                diff_png: None,
            });
        };

        let baseline_img = decode_rgba(&baseline_png)?;
        let mut candidate = decode_rgba(screenshot_png)?;

        if candidate.dimensions() != baseline_img.dimensions() {
            let (w, h) = baseline_img.dimensions();
            candidate = imageops::resize(&candidate, w, h, imageops::FilterType::Triangle);
        }

        let (mismatch_pct, diff) = diff_images(&baseline_img, &candidate);
        let passed = mismatch_pct <= self.threshold_pct;
        let diff_png = match diff {
            Some(diff) => Some(encode_png(&diff)?),
            None => None,
        };

        Ok(VisualCheck {
            outcome: VisualOutcome {
                baseline_key: key,
                baseline_missing: false,
                mismatch_pct: Some(mismatch_pct),
                passed,
                diff_image: None,
            },
            diff_png,
        })
    }

    /// Promote a screenshot to the baseline slot for its URL (visual accept)
    pub async fn promote_baseline(
        &self,
        project: &str,
        url: &str,
        screenshot_png: Vec<u8>,
    ) -> Result<String> {
        let key = baseline_key(project, url, VIEWPORT);
        match &self.store {
            Some(store) => {
                store.put(&key, screenshot_png).await?;
                Ok(key)
            }
            None => Err(VisualError::Storage(
                crate::storage::StorageError::NotConfigured,
            )),
        }
    }
}

/// Baseline object key for a (project, url, viewport) triple
pub fn baseline_key(project: &str, url: &str, viewport: (u32, u32)) -> String {
    format!(
        "baselines/{}/{}_{}x{}.png",
        project,
        slug_from_url(url),
        viewport.0,
        viewport.1
    )
}

/// URL path -> baseline slug: '/' becomes '_', trimmed; empty path is "root"
pub fn slug_from_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let slug = parsed.path().replace('/', "_");
            let slug = slug.trim_matches('_');
            if slug.is_empty() {
                "root".to_string()
            } else {
                slug.to_string()
            }
        }
        Err(_) => "route".to_string(),
    }
}

fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| VisualError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| VisualError::Decode(e.to_string()))?;
    Ok(img.to_rgba8())
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| VisualError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Per-pixel comparison over equal-sized images. Returns the mismatch share
/// (3 decimals) and, when any pixel differs, the per-channel absolute
/// difference image.
fn diff_images(a: &RgbaImage, b: &RgbaImage) -> (f64, Option<RgbaImage>) {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let (width, height) = a.dimensions();
    let total = (width as u64) * (height as u64);
    if total == 0 {
        return (0.0, None);
    }

    let mut diff = RgbaImage::new(width, height);
    let mut mismatched: u64 = 0;

    for (pa, (pb, pd)) in a.pixels().zip(b.pixels().zip(diff.pixels_mut())) {
        let mut differs = false;
        for channel in 0..4 {
            let delta = pa.0[channel].abs_diff(pb.0[channel]);
            pd.0[channel] = delta;
            if delta != 0 {
                differs = true;
            }
        }
        if differs {
            mismatched += 1;
        }
    }

    if mismatched == 0 {
        return (0.0, None);
    }

    let pct = (mismatched as f64) * 100.0 / (total as f64);
    (round3(pct), Some(diff))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use image::Rgba;

    fn png_of(color: [u8; 4], w: u32, h: u32) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(w, h, Rgba(color))).unwrap()
    }

    fn engine_with_store(auto: bool) -> (VisualEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = VisualEngine::new(Some(store.clone()), 0.1, auto);
        (engine, store)
    }

    #[test]
    fn test_slug_from_url() {
        assert_eq!(slug_from_url("https://x.test/"), "root");
        assert_eq!(slug_from_url("https://x.test"), "root");
        assert_eq!(slug_from_url("https://x.test/store/cart"), "store_cart");
        assert_eq!(slug_from_url("https://x.test/login?next=/"), "login");
        assert_eq!(slug_from_url("not a url"), "route");
    }

    #[test]
    fn test_baseline_key() {
        assert_eq!(
            baseline_key("shop", "https://x.test/cart", (1366, 900)),
            "baselines/shop/cart_1366x900.png"
        );
    }

    #[tokio::test]
    async fn test_missing_baseline_without_auto() {
        let (engine, store) = engine_with_store(false);
        let check = engine
            .compare("shop", "https://x.test/", &png_of([10, 20, 30, 255], 4, 4))
            .await
            .unwrap();

        assert!(check.outcome.passed);
        assert!(check.outcome.baseline_missing);
        assert!(check.outcome.mismatch_pct.is_none());
        // Nothing was promoted
        assert!(store
            .get("baselines/shop/root_1366x900.png")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_auto_baseline_round_trip() {
        let (engine, store) = engine_with_store(true);
        let shot = png_of([10, 20, 30, 255], 4, 4);

        let first = engine.compare("shop", "https://x.test/", &shot).await.unwrap();
        assert!(first.outcome.passed);
        assert!(first.outcome.baseline_missing);
        assert!(store
            .get("baselines/shop/root_1366x900.png")
            .await
            .unwrap()
            .is_some());

        // Identical re-render: mismatch is exactly zero
        let second = engine.compare("shop", "https://x.test/", &shot).await.unwrap();
        assert!(second.outcome.passed);
        assert!(!second.outcome.baseline_missing);
        assert_eq!(second.outcome.mismatch_pct, Some(0.0));
        assert!(second.diff_png.is_none());
    }

    #[tokio::test]
    async fn test_pixel_change_fails() {
        let (engine, _store) = engine_with_store(true);
        let shot = png_of([10, 20, 30, 255], 4, 4);
        engine.compare("shop", "https://x.test/", &shot).await.unwrap();

        let mut altered = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        altered.put_pixel(0, 0, Rgba([255, 20, 30, 255]));
        let altered_png = encode_png(&altered).unwrap();

        let check = engine
            .compare("shop", "https://x.test/", &altered_png)
            .await
            .unwrap();
        // 1 of 16 pixels
        assert_eq!(check.outcome.mismatch_pct, Some(6.25));
        assert!(!check.outcome.passed);
        assert!(check.diff_png.is_some());
    }

    #[tokio::test]
    async fn test_promote_baseline_then_pass() {
        let (engine, _store) = engine_with_store(false);
        let shot = png_of([1, 2, 3, 255], 4, 4);

        let key = engine
            .promote_baseline("shop", "https://x.test/cart", shot.clone())
            .await
            .unwrap();
        assert_eq!(key, "baselines/shop/cart_1366x900.png");

        let check = engine
            .compare("shop", "https://x.test/cart", &shot)
            .await
            .unwrap();
        assert_eq!(check.outcome.mismatch_pct, Some(0.0));
        assert!(check.outcome.passed);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_resizes() {
        let (engine, _store) = engine_with_store(true);
        engine
            .compare("shop", "https://x.test/", &png_of([9, 9, 9, 255], 8, 8))
            .await
            .unwrap();

        // Same color, different size: resize produces an identical frame
        let check = engine
            .compare("shop", "https://x.test/", &png_of([9, 9, 9, 255], 4, 4))
            .await
            .unwrap();
        assert_eq!(check.outcome.mismatch_pct, Some(0.0));
        assert!(check.outcome.passed);
    }

    #[test]
    fn test_round3() {
        let (pct, diff) = diff_images(
            &RgbaImage::from_pixel(3, 3, Rgba([0, 0, 0, 255])),
            &{
                let mut img = RgbaImage::from_pixel(3, 3, Rgba([0, 0, 0, 255]));
                img.put_pixel(0, 0, Rgba([1, 0, 0, 255]));
                img
            },
        );
        // 1/9 pixels = 11.111%
        assert_eq!(pct, 11.111);
        assert!(diff.is_some());
    }
}
