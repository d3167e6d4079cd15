use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "PROOFBOX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/proofbox.toml";
const ENV_PREFIX: &str = "PROOFBOX";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. Structured overrides (`PROOFBOX__SECTION__KEY`)
/// 5. Flat deployment variables (`TAAS_*`, `S3_*`, `PG*`, ...; highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_env(&mut config);

    Ok(config)
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // PROOFBOX__SERVER__BIND_ADDR -> server.bind_addr
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

/// Apply the flat environment names used by deployments of the platform.
/// Secrets (S3 keys, PG password, sidecar API keys) are only ever read from
/// the environment, never from TOML files.
fn load_env(config: &mut Config) {
    fn var(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.is_empty())
    }

    if let Some(dir) = var("TAAS_RESULTS_DIR") {
        config.server.results_dir = PathBuf::from(dir);
    }
    if let Some(dir) = var("TAAS_UPLOAD_DIR") {
        config.upload.dir = Some(PathBuf::from(dir));
    }
    if let Some(raw) = var("TAAS_UPLOAD_MAX_MB") {
        if let Ok(mb) = raw.parse::<f64>() {
            config.upload.max_mb = mb.max(0.0) as u64;
        }
    }
    if let Some(raw) = var("TAAS_UPLOAD_ALLOWED_EXTS") {
        let exts = parse_ext_list(&raw);
        if !exts.is_empty() {
            config.upload.allowed_exts = exts;
        }
    }
    if let Some(name) = var("TAAS_QUEUE_NAME") {
        config.queue.name = name;
    }
    if let Some(raw) = var("TAAS_CORS_ORIGINS") {
        config.server.cors_origins = parse_origins(&raw);
    }
    if let Some(key) = var("API_KEY") {
        config.server.api_key = Some(key);
    }
    if let Some(token) = var("ADMIN_TOKEN") {
        config.server.admin_token = Some(token);
    }

    if let Some(endpoint) = var("S3_ENDPOINT") {
        config.storage.endpoint = Some(endpoint);
    }
    if let Some(endpoint) = var("S3_PUBLIC_ENDPOINT") {
        config.storage.public_endpoint = Some(endpoint);
    }
    if let Some(key) = var("S3_ACCESS_KEY").or_else(|| var("AWS_ACCESS_KEY_ID")) {
        config.storage.access_key = Some(key);
    }
    if let Some(key) = var("S3_SECRET_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY")) {
        config.storage.secret_key = Some(key);
    }
    if let Some(bucket) = var("S3_BUCKET") {
        config.storage.bucket = bucket;
    }
    if let Some(region) = var("S3_REGION") {
        config.storage.region = region;
    }
    if let Some(raw) = var("ARTIFACT_TTL_SECONDS") {
        if let Ok(ttl) = raw.parse() {
            config.storage.artifact_ttl_secs = ttl;
        }
    }

    if let Some(host) = var("PGHOST") {
        config.database.host = host;
    }
    if let Some(raw) = var("PGPORT") {
        if let Ok(port) = raw.parse() {
            config.database.port = port;
        }
    }
    if let Some(user) = var("PGUSER") {
        config.database.user = user;
    }
    if let Some(password) = var("PGPASSWORD") {
        config.database.password = Some(password);
    }
    if let Some(dbname) = var("PGDATABASE") {
        config.database.dbname = dbname;
    }

    if let Some(url) = var("BROWSER_URL") {
        config.browser.url = Some(url);
    }

    if let Some(url) = var("PERF_URL") {
        config.perf.url = Some(url);
    }
    if let Some(raw) = var("PERF_TIMEOUT_SEC") {
        if let Ok(secs) = raw.parse() {
            config.perf.timeout_secs = secs;
        }
    }
    if let Some(raw) = var("PERF_SCORE_MIN") {
        if let Ok(v) = raw.parse() {
            config.perf.score_min = v;
        }
    }
    if let Some(raw) = var("PERF_LCP_MAX_MS") {
        if let Ok(v) = raw.parse() {
            config.perf.lcp_max_ms = v;
        }
    }
    if let Some(raw) = var("PERF_CLS_MAX") {
        if let Ok(v) = raw.parse() {
            config.perf.cls_max = v;
        }
    }
    if let Some(raw) = var("PERF_TTI_MAX_MS") {
        if let Ok(v) = raw.parse() {
            config.perf.tti_max_ms = v;
        }
    }

    if let Some(url) = var("ZAP_URL") {
        config.zap.url = Some(url);
    }
    if let Some(key) = var("ZAP_API_KEY") {
        config.zap.api_key = Some(key);
    }
    if let Some(raw) = var("ZAP_MAX_SECONDS") {
        if let Ok(secs) = raw.parse() {
            config.zap.max_seconds = secs;
        }
    }
    if let Some(raw) = var("ZAP_ALLOW_HIGH") {
        if let Ok(v) = raw.parse() {
            config.zap.allow_high = v;
        }
    }
    if let Some(raw) = var("ZAP_ALLOW_MEDIUM") {
        if let Ok(v) = raw.parse() {
            config.zap.allow_medium = v;
        }
    }
    if let Some(raw) = var("ZAP_EXCLUDE_REGEX") {
        config.zap.exclude_regex = Some(raw);
    }

    if let Some(raw) = var("VISUAL_THRESHOLD_PCT") {
        if let Ok(v) = raw.parse() {
            config.visual.threshold_pct = v;
        }
    }
    if let Some(raw) = var("VISUAL_AUTO_BASELINE") {
        config.visual.auto_baseline = raw == "1" || raw.eq_ignore_ascii_case("true");
    }

    if let Some(url) = var("MOBSF_URL") {
        config.mobsf.url = Some(url.trim_end_matches('/').to_string());
    }
    if let Some(key) = var("MOBSF_API_KEY") {
        config.mobsf.api_key = Some(key);
    }

    if let Some(url) = var("SLACK_WEBHOOK_URL") {
        config.notify.webhook_url = Some(url);
    }
}

/// Normalize a comma-separated extension list: "APK, .zip" -> ["apk", "zip"]
pub fn parse_ext_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Parse a CORS origin list; any "*" entry collapses to wildcard
pub fn parse_origins(raw: &str) -> Vec<String> {
    let parts: Vec<String> = raw
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.iter().any(|p| p == "*") {
        vec!["*".to_string()]
    } else {
        parts
    }
}
