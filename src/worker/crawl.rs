//! Bounded same-origin crawler for `test_type = auto`.
//!
//! BFS over a `(url, depth)` queue with a visited set. Bounds: a page cap
//! (default 6), same scheme+host+port as the seed, static-asset extensions
//! skipped. URLs are normalized (fragment dropped, query kept) before
//! dedup. Discovered pages are ordered by a path score so the interesting
//! surfaces (login, store, account, ...) are tested first.

use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_PAGES: usize = 6;

const STATIC_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "svg", "webp", "css", "js", "ico", "pdf", "zip",
];

const SCORE_KEYWORDS: &[&str] = &["login", "signin", "store", "home", "product", "account"];

pub struct Crawler {
    client: reqwest::Client,
    max_pages: usize,
}

impl Crawler {
    pub fn new(max_pages: usize) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("ProofBoxCrawler/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, max_pages }
    }

    /// Discover up to `max_pages` same-origin pages starting at `seed`,
    /// ordered by path score. Fetch failures skip the page silently; the
    /// crawl is exploratory, not an assertion.
    pub async fn crawl(&self, seed: &str) -> Vec<String> {
        let Ok(seed_url) = Url::parse(seed) else {
            return Vec::new();
        };

        let mut queue: VecDeque<(Url, u32)> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages: Vec<String> = Vec::new();

        queue.push_back((seed_url.clone(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if pages.len() >= self.max_pages {
                break;
            }
            let normalized = normalize_url(&current);
            if !seen.insert(normalized.clone()) {
                continue;
            }

            let Ok(response) = self.client.get(current.clone()).send().await else {
                continue;
            };
            if response.status().as_u16() >= 400 {
                continue;
            }
            let Ok(body) = response.text().await else {
                continue;
            };

            pages.push(normalized);

            for link in extract_links(&body, &current) {
                if !same_origin(&seed_url, &link) {
                    continue;
                }
                if is_static_path(link.path()) {
                    continue;
                }
                let candidate = normalize_url(&link);
                if !seen.contains(&candidate) {
                    queue.push_back((link, depth + 1));
                }
            }
        }

        pages.sort_by_key(|u| path_score(u));
        pages
    }
}

/// Resolve and collect hrefs from a document. Parsing happens in a scope of
/// its own so the non-Send DOM never lives across an await point.
fn extract_links(body: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("a[href]").expect("static selector");

    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.starts_with("javascript:"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

/// Drop the fragment, keep the query
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Whether a path points at a static asset the crawler should not visit
pub fn is_static_path(path: &str) -> bool {
    let Some(name) = path.rsplit('/').next() else {
        return false;
    };
    match name.rsplit_once('.') {
        Some((_, ext)) => STATIC_EXTS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Lower scores sort first; each recognized keyword in the path scores -10
pub fn path_score(raw: &str) -> i32 {
    let path = Url::parse(raw)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    let mut score = 0;
    for keyword in SCORE_KEYWORDS {
        if path.contains(keyword) {
            score -= 10;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drops_fragment_keeps_query() {
        let url = Url::parse("https://x.test/store?page=2#reviews").unwrap();
        assert_eq!(normalize_url(&url), "https://x.test/store?page=2");
    }

    #[test]
    fn test_same_origin() {
        let a = Url::parse("https://x.test/a").unwrap();
        assert!(same_origin(&a, &Url::parse("https://x.test/b?q=1").unwrap()));
        assert!(!same_origin(&a, &Url::parse("http://x.test/a").unwrap()));
        assert!(!same_origin(&a, &Url::parse("https://other.test/a").unwrap()));
        assert!(!same_origin(&a, &Url::parse("https://x.test:8443/a").unwrap()));
    }

    #[test]
    fn test_static_path_filter() {
        assert!(is_static_path("/assets/logo.png"));
        assert!(is_static_path("/bundle.JS"));
        assert!(is_static_path("/docs/manual.pdf"));
        assert!(!is_static_path("/store"));
        assert!(!is_static_path("/release-1.2/notes"));
        assert!(!is_static_path("/"));
    }

    #[test]
    fn test_path_score_prefers_auth_and_store() {
        assert_eq!(path_score("https://x.test/login"), -10);
        assert_eq!(path_score("https://x.test/store/product/1"), -20);
        assert_eq!(path_score("https://x.test/about"), 0);

        let mut urls = vec![
            "https://x.test/about".to_string(),
            "https://x.test/login".to_string(),
            "https://x.test/store".to_string(),
        ];
        urls.sort_by_key(|u| path_score(u));
        assert_eq!(urls[0], "https://x.test/login");
        assert_eq!(urls[2], "https://x.test/about");
    }

    #[test]
    fn test_extract_links() {
        let base = Url::parse("https://x.test/start").unwrap();
        let body = r#"
            <html><body>
              <a href="/store">Store</a>
              <a href="cart">Cart</a>
              <a href="https://other.test/away">Away</a>
              <a href="javascript:void(0)">Noop</a>
            </body></html>
        "#;
        let links = extract_links(body, &base);
        let rendered: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "https://x.test/store",
                "https://x.test/cart",
                "https://other.test/away",
            ]
        );
    }
}
