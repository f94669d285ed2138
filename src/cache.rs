//! Per-source freshness bookkeeping persisted across restarts.
//!
//! Freshness is decided in two tiers: [`DiscoveryCache::should_rescan`] does
//! the cheap work (record presence, TTL, a metadata-only stamp of a local
//! plugin's files), and [`DiscoveryCache::checksum_matches`] compares fingerprints once
//! a candidate has been scanned anyway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::manifest::manifest_path;
use crate::security::component_files;

pub const CACHE_FILE: &str = "discovery-cache.json";
pub const CACHE_FORMAT_VERSION: u32 = 1;
const MANIFEST_ENTRY: &str = ".claude-plugin/plugin.json";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCacheRecord {
    pub source_locator: String,
    pub last_scan_timestamp: DateTime<Utc>,
    pub last_known_checksum: String,
    /// Path, size and mtime digest of a local plugin's fingerprinted files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_stamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, DiscoveryCacheRecord>,
}

#[derive(Debug)]
pub struct DiscoveryCache {
    path: Option<PathBuf>,
    ttl: Duration,
    records: RwLock<BTreeMap<String, DiscoveryCacheRecord>>,
}

impl DiscoveryCache {
    /// A cache that is never written to disk.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            path: None,
            ttl,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Loads `<cache_dir>/discovery-cache.json`. A missing, unreadable or
    /// corrupt file yields an empty cache.
    pub async fn load(cache_dir: &Path, ttl: Duration) -> Self {
        let path = cache_dir.join(CACHE_FILE);
        let records = match read_records(&path).await {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable discovery cache");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), records = records.len(), "Loaded discovery cache");

        Self {
            path: Some(path),
            ttl,
            records: RwLock::new(records),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, locator: &str) -> Option<DiscoveryCacheRecord> {
        self.records.read().await.get(locator).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// True when `force` is set, no record exists, the TTL elapsed, or a
    /// local source's files were modified since the last scan.
    pub async fn should_rescan(&self, locator: &str, force: bool) -> bool {
        if force {
            return true;
        }
        let Some(record) = self.get(locator).await else {
            return true;
        };

        let age = Utc::now().signed_duration_since(record.last_scan_timestamp);
        let expired = age
            .to_std()
            .map(|age| age >= self.ttl)
            .unwrap_or(false);
        if expired {
            debug!(locator, "Cache record expired");
            return true;
        }

        match tree_stamp(locator).await {
            Some(stamp) => record.tree_stamp.as_deref() != Some(stamp.as_str()),
            None => false,
        }
    }

    pub async fn checksum_matches(&self, locator: &str, checksum: &str) -> bool {
        self.get(locator)
            .await
            .is_some_and(|r| r.last_known_checksum == checksum)
    }

    pub async fn record_scan(&self, locator: &str, checksum: &str) {
        let record = DiscoveryCacheRecord {
            source_locator: locator.to_string(),
            last_scan_timestamp: Utc::now(),
            last_known_checksum: checksum.to_string(),
            tree_stamp: tree_stamp(locator).await,
        };
        self.records
            .write()
            .await
            .insert(locator.to_string(), record);
    }

    pub async fn invalidate(&self, locator: &str) -> bool {
        self.records.write().await.remove(locator).is_some()
    }

    /// Writes the cache file atomically through a sibling temp file.
    pub async fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            records: self.records.read().await.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, path).await?;

        debug!(path = %path.display(), records = file.records.len(), "Persisted discovery cache");
        Ok(())
    }
}

async fn read_records(path: &Path) -> Result<BTreeMap<String, DiscoveryCacheRecord>, CacheError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let file: CacheFile = serde_json::from_slice(&content)?;
    if file.version != CACHE_FORMAT_VERSION {
        debug!(version = file.version, "Ignoring discovery cache with unknown version");
        return Ok(BTreeMap::new());
    }
    Ok(file.records)
}

/// blake3 over the relative path, size and mtime of a local plugin's manifest
/// and fingerprinted files. Adding, deleting or renaming a file changes the
/// stamp even when no remaining mtime moved. `None` for locators that are not
/// local directories.
async fn tree_stamp(locator: &str) -> Option<String> {
    let root = PathBuf::from(locator);
    if !tokio::fs::metadata(&root).await.ok()?.is_dir() {
        return None;
    }

    tokio::task::spawn_blocking(move || {
        let mut files = vec![(MANIFEST_ENTRY.to_string(), manifest_path(&root))];
        if let Ok(components) = component_files(&root) {
            files.extend(components);
        }

        let mut hasher = blake3::Hasher::new();
        for (relative, path) in files {
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_nanos());
            hasher.update(&(relative.len() as u64).to_le_bytes());
            hasher.update(relative.as_bytes());
            hasher.update(&metadata.len().to_le_bytes());
            hasher.update(&modified.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    })
    .await
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn plugin(root: &Path) {
        write(root, ".claude-plugin/plugin.json", r#"{"name":"a","version":"1.0.0"}"#);
        write(root, "commands/status.md", "Show status");
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_record_and_force() {
        let cache = DiscoveryCache::in_memory(DEFAULT_CACHE_TTL);
        assert!(cache.should_rescan("github:o/r", false).await);

        cache.record_scan("github:o/r", "abc").await;
        assert!(!cache.should_rescan("github:o/r", false).await);
        assert!(cache.should_rescan("github:o/r", true).await);
        assert!(cache.checksum_matches("github:o/r", "abc").await);
        assert!(!cache.checksum_matches("github:o/r", "def").await);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = DiscoveryCache::in_memory(Duration::ZERO);
        cache.record_scan("github:o/r", "abc").await;
        assert!(cache.should_rescan("github:o/r", false).await);
    }

    #[tokio::test]
    async fn test_local_mtime_probe() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("plugin-a");
        plugin(&root);
        set_mtime(&root.join("commands/status.md"), 120);
        set_mtime(&root.join(".claude-plugin/plugin.json"), 120);
        let locator = root.to_string_lossy().to_string();

        let cache = DiscoveryCache::in_memory(DEFAULT_CACHE_TTL);
        cache.record_scan(&locator, "abc").await;
        assert!(!cache.should_rescan(&locator, false).await);

        write(&root, "commands/status.md", "Show status, edited");
        assert!(cache.should_rescan(&locator, false).await);
    }

    #[tokio::test]
    async fn test_local_probe_sees_deleted_and_renamed_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("plugin-a");
        plugin(&root);
        write(&root, "commands/logs.md", "Show logs");
        set_mtime(&root.join("commands/logs.md"), 600);
        let locator = root.to_string_lossy().to_string();

        let cache = DiscoveryCache::in_memory(DEFAULT_CACHE_TTL);
        cache.record_scan(&locator, "abc").await;
        assert!(!cache.should_rescan(&locator, false).await);

        std::fs::rename(root.join("commands/logs.md"), root.join("commands/tail.md")).unwrap();
        assert!(cache.should_rescan(&locator, false).await);

        cache.record_scan(&locator, "def").await;
        std::fs::remove_file(root.join("commands/tail.md")).unwrap();
        assert!(cache.should_rescan(&locator, false).await);
    }

    #[tokio::test]
    async fn test_local_probe_sees_dependency_declarations() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("plugin-a");
        plugin(&root);
        let locator = root.to_string_lossy().to_string();

        let cache = DiscoveryCache::in_memory(DEFAULT_CACHE_TTL);
        cache.record_scan(&locator, "abc").await;
        write(&root, "requirements.txt", "requests>=2\n");
        assert!(cache.should_rescan(&locator, false).await);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let cache = DiscoveryCache::load(dir.path(), DEFAULT_CACHE_TTL).await;
        cache.record_scan("github:o/r", "abc").await;
        cache.persist().await.unwrap();
        assert!(dir.path().join(CACHE_FILE).is_file());
        assert!(!dir.path().join("discovery-cache.json.tmp").exists());

        let reloaded = DiscoveryCache::load(dir.path(), DEFAULT_CACHE_TTL).await;
        assert_eq!(reloaded.get("github:o/r").await, cache.get("github:o/r").await);
        assert!(!reloaded.should_rescan("github:o/r", false).await);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty_cache() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), "{ this is not json").unwrap();

        let cache = DiscoveryCache::load(dir.path(), DEFAULT_CACHE_TTL).await;
        assert!(cache.is_empty().await);
        assert!(cache.should_rescan("anything", false).await);

        cache.record_scan("anything", "abc").await;
        cache.persist().await.unwrap();
        let reloaded = DiscoveryCache::load(dir.path(), DEFAULT_CACHE_TTL).await;
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_format() {
        let dir = tempdir().unwrap();
        let cache = DiscoveryCache::load(dir.path(), DEFAULT_CACHE_TTL).await;
        cache.record_scan("github:o/r", "abc").await;
        cache.persist().await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(CACHE_FILE)).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        let record = &json["records"]["github:o/r"];
        assert_eq!(record["sourceLocator"], "github:o/r");
        assert_eq!(record["lastKnownChecksum"], "abc");
        assert!(record["lastScanTimestamp"].is_string());
        assert!(record.get("treeStamp").is_none());
    }
}
