//! Resolver configuration.
//!
//! ```rust,no_run
//! use claude_plugins::config::{EnvOverrides, ResolverConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ResolverConfig::load(".claude/plugins.json").await?;
//! EnvOverrides::new().apply(&mut config)?;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub use env::EnvOverrides;

use crate::common::home_dir;
use crate::sources::{ExponentialBackoff, RetryPolicy, SourceKind};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_CANDIDATES_PER_SOURCE: usize = 64;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// A remote plugin registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEndpoint {
    pub url: String,
    /// Sent as a bearer token.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub auth_token: Option<SecretString>,
    #[serde(default)]
    pub query: Option<String>,
}

impl RegistryEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            query: None,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_attempts: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            factor: 2.0,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            max_delay_ms: 30_000,
        }
    }
}

/// Inputs to discovery. Field names match the camelCase JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    pub plugin_dirs: Vec<PathBuf>,
    /// `github:org/repo[@ref]` or repository URLs.
    pub git_repositories: Vec<String>,
    pub registries: Vec<RegistryEndpoint>,
    /// Explicit manifest locations: `file://`, `http(s)://` or plain paths.
    pub manifest_urls: Vec<String>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub force_refresh: bool,
    pub max_concurrency: usize,
    pub max_candidates_per_source: usize,
    pub fetch_timeout_secs: u64,
    pub retry: RetrySettings,
    /// Higher wins when two sources provide the same plugin name.
    pub source_priority: BTreeMap<SourceKind, i32>,
    pub hot_reload: bool,
    pub debounce_ms: u64,
    /// Raw-content host for Git sources.
    pub git_raw_base: Option<String>,
    /// API host for Git release lookups.
    pub git_api_base: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: default_plugin_dir().into_iter().collect(),
            git_repositories: Vec::new(),
            registries: Vec::new(),
            manifest_urls: Vec::new(),
            cache_dir: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            force_refresh: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_candidates_per_source: DEFAULT_MAX_CANDIDATES_PER_SOURCE,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            retry: RetrySettings::default(),
            source_priority: BTreeMap::new(),
            hot_reload: false,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            git_raw_base: None,
            git_api_base: None,
        }
    }
}

/// `~/.claude/plugins`
pub fn default_plugin_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".claude").join("plugins"))
}

/// `~/.claude/plugins/.cache`, or a directory under the system temp dir when
/// no home directory is known.
pub fn default_cache_dir() -> PathBuf {
    default_plugin_dir()
        .map(|dir| dir.join(".cache"))
        .unwrap_or_else(|| std::env::temp_dir().join("claude-plugins-cache"))
}

impl ResolverConfig {
    /// Configuration with no sources at all.
    pub fn empty() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dirs.push(dir.into());
        self
    }

    pub fn with_git_repository(mut self, locator: impl Into<String>) -> Self {
        self.git_repositories.push(locator.into());
        self
    }

    pub fn with_registry(mut self, endpoint: RegistryEndpoint) -> Self {
        self.registries.push(endpoint);
        self
    }

    pub fn with_manifest_url(mut self, locator: impl Into<String>) -> Self {
        self.manifest_urls.push(locator.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_source_priority(mut self, kind: SourceKind, priority: i32) -> Self {
        self.source_priority.insert(kind, priority);
        self
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Archives and clones live under `<cache_dir>/store`.
    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir().join("store")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn priority_for(&self, kind: SourceKind) -> i32 {
        self.source_priority.get(&kind).copied().unwrap_or(0)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.factor,
        );
        RetryPolicy::new(
            backoff,
            self.retry.max_attempts,
            Duration::from_secs(self.fetch_timeout_secs),
        )
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("maxConcurrency", "must be at least 1"));
        }
        if self.max_candidates_per_source == 0 {
            return Err(ConfigError::invalid(
                "maxCandidatesPerSource",
                "must be at least 1",
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid("fetchTimeoutSecs", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.maxAttempts", "must be at least 1"));
        }
        if !(self.retry.factor.is_finite() && self.retry.factor >= 1.0) {
            return Err(ConfigError::invalid("retry.factor", "must be >= 1.0"));
        }
        for endpoint in &self.registries {
            url::Url::parse(&endpoint.url)
                .map_err(|e| ConfigError::invalid("registries.url", format!("{}: {e}", endpoint.url)))?;
        }
        Ok(())
    }
}
