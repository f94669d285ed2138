//! JSON configuration files.

use std::path::Path;

use tracing::debug;

use super::{ConfigResult, ResolverConfig};

impl ResolverConfig {
    /// Reads a JSON configuration file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No resolver config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded resolver config");
        Ok(config)
    }
}
