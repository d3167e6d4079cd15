use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub perf: PerfConfig,
    #[serde(default)]
    pub zap: ZapConfig,
    #[serde(default)]
    pub visual: VisualConfig,
    #[serde(default)]
    pub mobsf: MobsfConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            browser: BrowserConfig::default(),
            perf: PerfConfig::default(),
            zap: ZapConfig::default(),
            visual: VisualConfig::default(),
            mobsf: MobsfConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Where per-job status documents and captured artifacts land
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Per-site route/assertion config documents ({sites_dir}/{site}.toml)
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,
    /// Allowed CORS origins; ["*"] means any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Legacy global API key; bypasses the per-key rate limiter
    pub api_key: Option<String>,
    /// Admin token for key management endpoints
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            results_dir: default_results_dir(),
            sites_dir: default_sites_dir(),
            cors_origins: default_cors_origins(),
            api_key: None,
            admin_token: None,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("test-results/taas")
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("config/sites")
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Mobile artifact upload policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Directory uploaded files are streamed into. Must be shared with the
    /// worker processes (volume mount in split deployments).
    pub dir: Option<PathBuf>,
    #[serde(default = "default_upload_max_mb")]
    pub max_mb: u64,
    #[serde(default = "default_allowed_exts")]
    pub allowed_exts: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_mb: default_upload_max_mb(),
            allowed_exts: default_allowed_exts(),
        }
    }
}

impl UploadConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_mb * 1024 * 1024
    }

    /// Upload dir defaults to {results_dir}/uploads when unset
    pub fn resolve_dir(&self, results_dir: &std::path::Path) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| results_dir.join("uploads"))
    }
}

fn default_upload_max_mb() -> u64 {
    200
}

fn default_allowed_exts() -> Vec<String> {
    ["apk", "aab", "ipa", "zip"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Durable queue + worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_queue_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            data_path: default_queue_path(),
            workers: default_workers(),
            channel_size: default_channel_size(),
        }
    }
}

fn default_queue_name() -> String {
    "taas".to_string()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_workers() -> usize {
    4
}

fn default_channel_size() -> usize {
    100
}

/// S3-compatible object storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    /// Endpoint baked into presigned URLs; falls back to `endpoint`.
    /// Needed when clients reach the store through a different network edge.
    pub public_endpoint: Option<String>,
    /// S3 credentials (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    #[serde(skip)]
    pub secret_key: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_artifact_ttl")]
    pub artifact_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            public_endpoint: None,
            access_key: None,
            secret_key: None,
            bucket: default_bucket(),
            region: default_region(),
            artifact_ttl_secs: default_artifact_ttl(),
        }
    }
}

impl StorageConfig {
    pub fn configured(&self) -> bool {
        self.endpoint.is_some() && self.access_key.is_some() && self.secret_key.is_some()
    }
}

fn default_bucket() -> String {
    "taas-artifacts".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_artifact_ttl() -> u64 {
    86_400
}

/// Postgres connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(default = "default_pg_dbname")]
    pub dbname: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: None,
            dbname: default_pg_dbname(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_pg_host() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "taas".to_string()
}

fn default_pg_dbname() -> String {
    "taas".to_string()
}

fn default_pool_size() -> usize {
    8
}

/// Browser automation sidecar
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    pub url: Option<String>,
    #[serde(default = "default_nav_timeout")]
    pub navigation_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            url: None,
            navigation_timeout_secs: default_nav_timeout(),
        }
    }
}

fn default_nav_timeout() -> u64 {
    30
}

/// Lighthouse performance sidecar + thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerfConfig {
    pub url: Option<String>,
    #[serde(default = "default_perf_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_score_min")]
    pub score_min: f64,
    #[serde(default = "default_lcp_max_ms")]
    pub lcp_max_ms: f64,
    #[serde(default = "default_cls_max")]
    pub cls_max: f64,
    #[serde(default = "default_tti_max_ms")]
    pub tti_max_ms: f64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_perf_timeout(),
            score_min: default_score_min(),
            lcp_max_ms: default_lcp_max_ms(),
            cls_max: default_cls_max(),
            tti_max_ms: default_tti_max_ms(),
        }
    }
}

fn default_perf_timeout() -> u64 {
    240
}

fn default_score_min() -> f64 {
    80.0
}

fn default_lcp_max_ms() -> f64 {
    2500.0
}

fn default_cls_max() -> f64 {
    0.1
}

fn default_tti_max_ms() -> f64 {
    5000.0
}

/// ZAP security scanner + thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZapConfig {
    pub url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_zap_max")]
    pub max_seconds: u64,
    #[serde(default)]
    pub allow_high: u32,
    #[serde(default)]
    pub allow_medium: u32,
    /// Comma-separated extra exclusion regexes for alert URLs
    pub exclude_regex: Option<String>,
}

impl Default for ZapConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            max_seconds: default_zap_max(),
            allow_high: 0,
            allow_medium: 0,
            exclude_regex: None,
        }
    }
}

fn default_zap_max() -> u64 {
    180
}

/// Visual regression settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VisualConfig {
    #[serde(default = "default_visual_threshold")]
    pub threshold_pct: f64,
    #[serde(default)]
    pub auto_baseline: bool,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            threshold_pct: default_visual_threshold(),
            auto_baseline: false,
        }
    }
}

fn default_visual_threshold() -> f64 {
    0.1
}

/// MobSF static analyzer
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MobsfConfig {
    pub url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl MobsfConfig {
    pub fn configured(&self) -> bool {
        self.url.is_some() && self.api_key.is_some()
    }
}

/// Completion webhook
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}
