//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (PIXCACHE_*)
//! 2. TOML config file (if PIXCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::policy::CachePolicy;

mod validation;

pub use validation::ConfigError;

/// Image content types accepted when nothing else is configured.
pub const DEFAULT_ACCEPTED_CONTENT_TYPES: &[&str] =
    &["image/png", "image/jpg", "image/jpeg", "image/bmp", "image/gif", "image/tiff", "image/webp"];

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (PIXCACHE_*)
/// 2. TOML config file (if PIXCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root directory for cached payloads and their metadata sidecars.
    ///
    /// Set via PIXCACHE_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Byte budget of the in-memory image cache.
    ///
    /// Set via PIXCACHE_MEMORY_MAX_BYTES environment variable.
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: usize,

    /// Honor server caching headers. When false the disk cache is
    /// authoritative once an entry exists.
    #[serde(default = "default_true")]
    pub use_server_cache_policy: bool,

    /// Lifetime in seconds for responses that carry only an ETag.
    /// 0 means always revalidate.
    #[serde(default)]
    pub etag_only_cache_control_secs: u64,

    /// Keep images loaded by three-phase loads in the memory cache. Disk-cache
    /// loads always do.
    #[serde(default)]
    pub cache_images_in_memory: bool,

    /// Accept any TLS certificate chain.
    #[serde(default)]
    pub trust_any_ssl_certificate: bool,

    /// Username for the Authorization header.
    #[serde(default)]
    pub auth_username: Option<String>,

    /// Password for the Authorization header.
    #[serde(default)]
    pub auth_password: Option<String>,

    /// Log image URLs that missed both cache tiers.
    #[serde(default)]
    pub log_cache_misses: bool,

    /// Log warnings about missing caching headers on responses.
    #[serde(default)]
    pub log_response_warnings: bool,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via PIXCACHE_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum response body size accepted from the network.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum number of redirects to follow.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Content types treated as images.
    #[serde(default = "default_accepted_content_types")]
    pub accepted_content_types: Vec<String>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./pixcache-cache")
}

fn default_memory_max_bytes() -> usize {
    25 * 1024 * 1024 // 25MB
}

fn default_user_agent() -> String {
    "pixcache/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_redirects() -> usize {
    5
}

fn default_accepted_content_types() -> Vec<String> {
    DEFAULT_ACCEPTED_CONTENT_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            memory_max_bytes: default_memory_max_bytes(),
            use_server_cache_policy: true,
            etag_only_cache_control_secs: 0,
            cache_images_in_memory: false,
            trust_any_ssl_certificate: false,
            auth_username: None,
            auth_password: None,
            log_cache_misses: false,
            log_response_warnings: false,
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            max_redirects: default_max_redirects(),
            accepted_content_types: default_accepted_content_types(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// ETag-only fallback lifetime as a Duration.
    pub fn etag_only_cache_control(&self) -> Duration {
        Duration::from_secs(self.etag_only_cache_control_secs)
    }

    /// The slice of configuration consumed by the cache policy.
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            use_server_cache_policy: self.use_server_cache_policy,
            etag_only_ttl: self.etag_only_cache_control(),
            accepted_content_types: self
                .accepted_content_types
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `PIXCACHE_`
    /// 2. TOML file from `PIXCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// The layered figment used by [`AppConfig::load`].
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("PIXCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment.merge(
            Env::prefixed("PIXCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        )
    }

    /// Extract and validate configuration from an arbitrary figment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::LoadFailed` when extraction fails, or the
    /// validation error otherwise.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Both credential halves, when configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.auth_username.as_deref(), self.auth_password.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}
