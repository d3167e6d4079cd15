//! Per-site route and assertion configuration.
//!
//! A site document lives at `{sites_dir}/{site}.toml`:
//!
//! ```toml
//! base_url = "https://shop.example.test"
//!
//! [routes]
//! public = ["/", "/store"]
//! protected = ["/account"]
//!
//! [assertions]
//! "/cart" = ["button#checkout"]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    pub base_url: Option<String>,
    #[serde(default)]
    pub routes: SiteRoutes,
    /// route -> CSS selectors that must each match at least once
    #[serde(default)]
    pub assertions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteRoutes {
    #[serde(default)]
    pub public: Vec<String>,
    #[serde(default)]
    pub protected: Vec<String>,
}

impl SiteConfig {
    /// Public routes first, then protected; the order tests run in
    pub fn route_list(&self) -> Vec<String> {
        let mut out = self.routes.public.clone();
        out.extend(self.routes.protected.iter().cloned());
        if out.is_empty() {
            out.push("/".to_string());
        }
        out
    }

    pub fn selectors_for(&self, route: &str) -> &[String] {
        self.assertions
            .get(route)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Load a site document; absent or malformed files read as None
pub fn load_site(sites_dir: &Path, site: &str) -> Option<SiteConfig> {
    let path = sites_dir.join(format!("{site}.toml"));
    let raw = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&raw) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(site, path = %path.display(), error = %err, "Invalid site config");
            None
        }
    }
}

/// Resolve routes against a base URL; absolute routes pass through untouched
pub fn to_abs_urls(base_url: Option<&str>, routes: &[String]) -> Vec<String> {
    let base = base_url.unwrap_or("").trim_end_matches('/');
    routes
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(|r| {
            if r.starts_with("http://") || r.starts_with("https://") {
                r.to_string()
            } else if r.starts_with('/') {
                format!("{base}{r}")
            } else {
                format!("{base}/{r}")
            }
        })
        .collect()
}
