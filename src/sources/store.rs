//! Content-addressed store for downloaded plugin archives and clones.
//!
//! Layout under the store root:
//!
//! ```text
//! <digest>/        extracted archive, addressed by blake3 of the archive bytes
//! git/<key>/       shallow clones, keyed by blake3 of the repository locator
//! direct/<key>/    staging roots for remote manifest URLs
//! ```

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use super::{FetchError, HttpFetcher};
use crate::manifest::is_plugin_root;

pub const MAX_ARCHIVE_ENTRIES: usize = 10_000;
pub const MAX_ARCHIVE_SIZE: u64 = 100 * 1024 * 1024;

const COMPLETE_MARKER: &str = ".complete";

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    pub fn git_dir(&self, locator: &str) -> PathBuf {
        self.root.join("git").join(locator_key(locator))
    }

    pub fn direct_dir(&self, locator: &str) -> PathBuf {
        self.root.join("direct").join(locator_key(locator))
    }

    /// Returns the plugin root of an already extracted archive.
    pub fn lookup(&self, digest: &str) -> Option<PathBuf> {
        let dir = self.archive_dir(digest);
        if !dir.join(COMPLETE_MARKER).is_file() {
            return None;
        }
        find_plugin_root(&dir).ok()
    }

    /// Downloads and extracts a `.tar.gz` plugin archive.
    ///
    /// With an expected digest an existing extraction is reused without any
    /// network access; otherwise the downloaded bytes must hash to it.
    pub async fn fetch_archive(
        &self,
        http: &HttpFetcher,
        url: &str,
        expected_digest: Option<&str>,
    ) -> Result<PathBuf, FetchError> {
        if let Some(digest) = expected_digest
            && let Some(root) = self.lookup(digest)
        {
            debug!(url, digest, "Reusing stored archive");
            return Ok(root);
        }

        let bytes = http.get_bytes(url, None, MAX_ARCHIVE_SIZE).await?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        if let Some(expected) = expected_digest
            && !expected.eq_ignore_ascii_case(&digest)
        {
            return Err(FetchError::Integrity {
                expected: expected.to_string(),
                actual: digest,
            });
        }

        if let Some(root) = self.lookup(&digest) {
            return Ok(root);
        }

        let store = self.clone();
        let digest_for_task = digest.clone();
        let root = tokio::task::spawn_blocking(move || store.install(&bytes, &digest_for_task))
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;

        info!(url, digest = %digest, root = %root.display(), "Stored plugin archive");
        Ok(root)
    }

    fn install(&self, bytes: &[u8], digest: &str) -> Result<PathBuf, FetchError> {
        std::fs::create_dir_all(&self.root)?;
        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(&self.root)?;

        extract_archive(bytes, staging.path())?;
        std::fs::write(staging.path().join(COMPLETE_MARKER), digest)?;

        let target = self.archive_dir(digest);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(staging.keep(), &target)?;

        find_plugin_root(&target)
    }
}

/// The archive itself, or its single top-level directory, must be a plugin root.
pub fn find_plugin_root(dir: &Path) -> Result<PathBuf, FetchError> {
    if is_plugin_root(dir) {
        return Ok(dir.to_path_buf());
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.path());
        }
    }

    match children.as_slice() {
        [only] if is_plugin_root(only) => Ok(only.clone()),
        _ => Err(FetchError::NotFound(format!(
            "no plugin manifest in {}",
            dir.display()
        ))),
    }
}

fn locator_key(locator: &str) -> String {
    blake3::hash(locator.as_bytes()).to_hex()[..32].to_string()
}

/// Extracts a gzip-compressed tar into `dest`, refusing anything that could
/// escape it or exhaust the disk.
pub(crate) fn extract_archive(data: &[u8], dest: &Path) -> Result<(), FetchError> {
    let decoder = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(false);

    let mut entry_count = 0usize;
    let mut total_size = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| FetchError::Archive(format!("failed to read entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| FetchError::Archive(format!("failed to read entry: {e}")))?;

        entry_count += 1;
        if entry_count > MAX_ARCHIVE_ENTRIES {
            return Err(FetchError::Archive(format!(
                "more than {MAX_ARCHIVE_ENTRIES} entries"
            )));
        }

        let entry_type = entry.header().entry_type();
        let path = entry
            .path()
            .map_err(|e| FetchError::Archive(format!("invalid entry path: {e}")))?
            .into_owned();

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            tar::EntryType::XHeader | tar::EntryType::XGlobalHeader | tar::EntryType::GNULongName => {
                continue;
            }
            other => {
                return Err(FetchError::Archive(format!(
                    "unsupported entry type {other:?} at {}",
                    path.display()
                )));
            }
        }

        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(FetchError::Archive(format!(
                "entry escapes archive root: {}",
                path.display()
            )));
        }

        total_size = total_size.saturating_add(entry.header().size().unwrap_or(0));
        if total_size > MAX_ARCHIVE_SIZE {
            return Err(FetchError::TooLarge {
                size: total_size,
                limit: MAX_ARCHIVE_SIZE,
            });
        }

        let target = dest.join(&path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| FetchError::Archive(format!("failed to unpack {}: {e}", path.display())))?;
    }

    if entry_count == 0 {
        return Err(FetchError::Archive("archive is empty".into()));
    }

    Ok(())
}
