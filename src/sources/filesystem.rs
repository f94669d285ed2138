use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::debug;

use super::{
    Candidate, Enumerated, FetchError, FetchedManifest, SourceDiagnostic, SourceKind, SourceProbe,
    capped, read_local_manifest,
};
use crate::common::sorted_entries;
use crate::manifest::is_plugin_root;

/// Roots scanned concurrently.
const ROOT_FAN_OUT: usize = 4;

/// Enumerates plugin directories under configured local roots.
///
/// A root that is itself a plugin yields exactly that plugin; otherwise only
/// its immediate children carrying a manifest are candidates.
pub struct FilesystemProbe {
    roots: Vec<PathBuf>,
    max_candidates: usize,
}

impl FilesystemProbe {
    pub fn new(roots: Vec<PathBuf>, max_candidates: usize) -> Self {
        Self {
            roots,
            max_candidates,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    async fn scan_root(root: PathBuf) -> Vec<Enumerated> {
        let locator = root.display().to_string();

        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return vec![Err(SourceDiagnostic::new(
                    SourceKind::Filesystem,
                    locator,
                    "not a directory",
                ))];
            }
            Err(e) => {
                return vec![Err(SourceDiagnostic::new(SourceKind::Filesystem, locator, e))];
            }
        }

        if is_plugin_root(&root) {
            return vec![Ok(local_candidate(&root))];
        }

        match sorted_entries(&root).await {
            Ok(entries) => {
                let candidates: Vec<Enumerated> = entries
                    .into_iter()
                    .filter(|path| path.is_dir() && is_plugin_root(path))
                    .map(|path| Ok(local_candidate(&path)))
                    .collect();
                debug!(root = %locator, count = candidates.len(), "Scanned plugin root");
                candidates
            }
            Err(e) => vec![Err(SourceDiagnostic::new(SourceKind::Filesystem, locator, e))],
        }
    }
}

fn local_candidate(path: &Path) -> Candidate {
    Candidate::new(SourceKind::Filesystem, path.display().to_string())
}

#[async_trait]
impl SourceProbe for FilesystemProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    fn describe(&self) -> String {
        format!("filesystem ({} roots)", self.roots.len())
    }

    fn enumerate(&self) -> BoxStream<'_, Enumerated> {
        let scans = stream::iter(self.roots.clone())
            .map(Self::scan_root)
            .buffered(ROOT_FAN_OUT)
            .flat_map(stream::iter)
            .boxed();
        capped(scans, SourceKind::Filesystem, self.max_candidates)
    }

    async fn fetch_manifest(&self, candidate: &Candidate) -> Result<FetchedManifest, FetchError> {
        read_local_manifest(PathBuf::from(&candidate.locator)).await
    }
}
