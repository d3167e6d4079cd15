//! Configuration management for ProofBox
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Environment Variables
//!
//! Structured overrides use the pattern `PROOFBOX__<section>__<key>`, e.g.
//! `PROOFBOX__SERVER__BIND_ADDR=0.0.0.0:9000`. On top of that, the flat
//! deployment variables (`TAAS_RESULTS_DIR`, `TAAS_QUEUE_NAME`, `API_KEY`,
//! `ADMIN_TOKEN`, `S3_*`, `PG*`, `PERF_*`, `ZAP_*`, `VISUAL_*`, `MOBSF_*`,
//! `SLACK_WEBHOOK_URL`, ...) are recognized so container deployments need no
//! config file at all. Secrets are only ever read from the environment.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/proofbox.toml`.
//! This can be overridden using the `PROOFBOX_CONFIG` environment variable.

mod models;
mod sources;

pub use models::{
    BrowserConfig, Config, DatabaseConfig, MobsfConfig, NotifyConfig, PerfConfig, QueueConfig,
    ServerConfig, StorageConfig, UploadConfig, VisualConfig, ZapConfig,
};
pub use sources::{parse_ext_list, parse_origins};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    pub fn load() -> Result<Self, ConfigError> {
        Ok(sources::load()?)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }
}
