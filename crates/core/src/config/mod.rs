//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (OFFGRID_*)
//! 2. TOML config file (if OFFGRID_CONFIG_FILE set)
//! 3. Built-in defaults

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::GenerationId;
use crate::resource::NormalizePolicy;

mod validation;

pub use validation::ConfigError;

/// Order in which the store and the network are consulted for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve from the store; fall back to the network on a miss.
    CacheFirst,
    /// Ask the network; fall back to the store when it fails.
    NetworkFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::CacheFirst => f.write_str("cache-first"),
            Strategy::NetworkFirst => f.write_str("network-first"),
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cache-first" | "cache_first" => Ok(Strategy::CacheFirst),
            "network-first" | "network_first" => Ok(Strategy::NetworkFirst),
            other => Err(ConfigError::Invalid {
                field: "strategy".into(),
                reason: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

/// Per-URL strategy override. The first route whose pattern matches wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Regex matched against the normalized URL.
    pub pattern: String,
    pub strategy: Strategy,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (OFFGRID_*)
/// 2. TOML config file (if OFFGRID_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite store.
    ///
    /// Set via OFFGRID_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Name of the cache generation.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Version tag of the generation this process installs.
    ///
    /// Set via OFFGRID_CACHE_VERSION environment variable.
    #[serde(default = "default_cache_version")]
    pub cache_version: String,

    /// Pages whose resources are discovered at install and on every refresh.
    #[serde(default)]
    pub pages: Vec<String>,

    /// Extra resources precached at install.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Default fetch strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    /// Strategy overrides by URL pattern.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Regexes on the URL path; matching references are never discovered.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Drop query strings when normalizing references.
    #[serde(default = "default_true")]
    pub strip_query: bool,

    /// Only discover and store resources from the page's own origin.
    #[serde(default)]
    pub same_origin_only: bool,

    /// A newly installed generation takes over without waiting.
    #[serde(default = "default_true")]
    pub skip_waiting: bool,

    /// Cached page served to navigation requests that cannot be answered.
    #[serde(default)]
    pub offline_page: Option<String>,

    /// Refresh scheduler period in milliseconds.
    ///
    /// Set via OFFGRID_REFRESH_INTERVAL_MS environment variable.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Concurrent per-resource fetches during a batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-resource fetch timeout in milliseconds.
    ///
    /// Set via OFFGRID_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum bytes to fetch per resource.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Total payload bytes the store accepts.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Entry cap per generation; oldest entries are evicted beyond it.
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./offgrid-cache.sqlite")
}

fn default_cache_name() -> String {
    "offgrid".into()
}

fn default_cache_version() -> String {
    "v1".into()
}

fn default_strategy() -> Strategy {
    Strategy::CacheFirst
}

fn default_refresh_interval_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_quota_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_user_agent() -> String {
    "offgrid/0.1".into()
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_name: default_cache_name(),
            cache_version: default_cache_version(),
            pages: Vec::new(),
            resources: Vec::new(),
            strategy: default_strategy(),
            routes: Vec::new(),
            exclude_patterns: Vec::new(),
            strip_query: true,
            same_origin_only: false,
            skip_waiting: true,
            offline_page: None,
            refresh_interval_ms: default_refresh_interval_ms(),
            batch_size: default_batch_size(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
            quota_bytes: default_quota_bytes(),
            max_entries: None,
            user_agent: default_user_agent(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// The generation this configuration installs.
    pub fn generation(&self) -> GenerationId {
        GenerationId::new(&self.cache_name, &self.cache_version)
    }

    pub fn normalize_policy(&self) -> NormalizePolicy {
        NormalizePolicy { strip_query: self.strip_query }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `OFFGRID_`
    /// 2. TOML file from `OFFGRID_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("OFFGRID_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("OFFGRID_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
