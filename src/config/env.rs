//! Environment variable overrides.
//!
//! Environment variables are read, never written; they are treated as
//! immutable for the lifetime of the process.

use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, ConfigResult, ResolverConfig};

pub const DEFAULT_PREFIX: &str = "CLAUDE_PLUGIN_";

/// Applies `CLAUDE_PLUGIN_*` variables on top of a loaded configuration.
///
/// | Variable | Effect |
/// |---|---|
/// | `CLAUDE_PLUGIN_PATH` | extra plugin roots, OS path-list separated |
/// | `CLAUDE_PLUGIN_CACHE_DIR` | cache directory |
/// | `CLAUDE_PLUGIN_CACHE_TTL` | cache TTL in seconds |
/// | `CLAUDE_PLUGIN_FORCE_REFRESH` | `1`/`true`/`yes` forces a rescan |
/// | `CLAUDE_PLUGIN_MAX_CONCURRENCY` | candidate pipeline concurrency |
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    prefix: String,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        let env_key = self.env_key(key);
        match std::env::var(&env_key) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::invalid(env_key, e.to_string())),
        }
    }

    /// Applies variables from the process environment.
    pub fn apply(&self, config: &mut ResolverConfig) -> ConfigResult<()> {
        let mut lookup_error = None;
        self.apply_from(config, |key| match self.get_raw(key) {
            Ok(value) => value,
            Err(e) => {
                lookup_error.get_or_insert(e);
                None
            }
        })?;
        match lookup_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Applies variables supplied by `lookup`, keyed without the prefix
    /// (`path`, `cache.dir`, ...).
    pub fn apply_from<F>(&self, config: &mut ResolverConfig, mut lookup: F) -> ConfigResult<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(paths) = lookup("path") {
            config
                .plugin_dirs
                .extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Some(dir) = lookup("cache.dir").filter(|d| !d.is_empty()) {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(ttl) = lookup("cache.ttl") {
            config.cache_ttl_secs = self.parse("cache.ttl", &ttl)?;
        }
        if let Some(flag) = lookup("force.refresh") {
            config.force_refresh = self.parse_flag("force.refresh", &flag)?;
        }
        if let Some(max) = lookup("max.concurrency") {
            let max: usize = self.parse("max.concurrency", &max)?;
            if max == 0 {
                return Err(ConfigError::invalid(
                    self.env_key("max.concurrency"),
                    "must be at least 1",
                ));
            }
            config.max_concurrency = max;
        }
        Ok(())
    }

    fn parse<T>(&self, key: &str, raw: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        raw.trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(self.env_key(key), format!("'{raw}': {e}")))
    }

    fn parse_flag(&self, key: &str, raw: &str) -> ConfigResult<bool> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::invalid(
                self.env_key(key),
                format!("'{raw}' is not a boolean"),
            )),
        }
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::new()
    }
}
