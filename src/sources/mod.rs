//! Candidate enumeration across plugin sources.
//!
//! Every source implements [`SourceProbe`]. Enumeration is lazy and capped per
//! pass; a broken root or endpoint yields a [`SourceDiagnostic`] in the stream
//! instead of ending it.

mod direct;
mod filesystem;
mod git;
mod http;
mod registry;
mod retry;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use direct::DirectUrlProbe;
pub use filesystem::FilesystemProbe;
pub use git::{GitProbe, GitRepository, RELEASE_ASSET_SUFFIXES};
pub use http::HttpFetcher;
pub use registry::{RegistryHit, RegistryProbe, SearchResponse};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use store::{ContentStore, MAX_ARCHIVE_ENTRIES, MAX_ARCHIVE_SIZE};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Filesystem,
    Git,
    Registry,
    DirectUrl,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Git => write!(f, "git"),
            Self::Registry => write!(f, "registry"),
            Self::DirectUrl => write!(f, "direct-url"),
        }
    }
}

/// A discovered but unvalidated plugin location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source_kind: SourceKind,
    /// Path, repository, download URL or manifest URL.
    pub locator: String,
    /// Set once the manifest has been fetched.
    pub raw_manifest_bytes: Option<Bytes>,
    /// Expected blake3 digest of a downloadable archive.
    pub digest: Option<String>,
}

impl Candidate {
    pub fn new(source_kind: SourceKind, locator: impl Into<String>) -> Self {
        Self {
            source_kind,
            locator: locator.into(),
            raw_manifest_bytes: None,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: Option<String>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_manifest_bytes(mut self, bytes: Bytes) -> Self {
        self.raw_manifest_bytes = Some(bytes);
        self
    }
}

/// Manifest bytes together with the local directory they describe.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub bytes: Bytes,
    pub root: PathBuf,
}

/// Non-fatal enumeration failure keyed by source locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDiagnostic {
    pub source_kind: SourceKind,
    pub locator: String,
    pub message: String,
}

impl SourceDiagnostic {
    pub fn new(source_kind: SourceKind, locator: impl Into<String>, message: impl ToString) -> Self {
        Self {
            source_kind,
            locator: locator.into(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for SourceDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.source_kind, self.locator, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {}ms: {locator}", .after.as_millis())]
    Timeout { locator: String, after: Duration },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Download too large: {size} bytes exceeds {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Unsupported locator: {0}")]
    Unsupported(String),
}

impl FetchError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

pub type Enumerated = Result<Candidate, SourceDiagnostic>;

#[async_trait]
pub trait SourceProbe: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Lazily yields candidates, at most the probe's cap per pass.
    fn enumerate(&self) -> BoxStream<'_, Enumerated>;

    async fn fetch_manifest(&self, candidate: &Candidate) -> Result<FetchedManifest, FetchError>;
}

/// Limits successful candidates to `cap`; diagnostics always pass through.
pub(crate) fn capped<'a>(
    stream: BoxStream<'a, Enumerated>,
    kind: SourceKind,
    cap: usize,
) -> BoxStream<'a, Enumerated> {
    let mut emitted = 0usize;
    stream
        .filter(move |item| {
            let keep = match item {
                Ok(candidate) => {
                    emitted += 1;
                    if emitted == cap + 1 {
                        warn!(
                            source = %kind,
                            cap,
                            locator = %candidate.locator,
                            "Candidate cap reached, remaining candidates deferred"
                        );
                    }
                    emitted <= cap
                }
                Err(_) => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

/// Reads a local manifest, mapping a missing file to [`FetchError::NotFound`].
pub(crate) async fn read_local_manifest(root: PathBuf) -> Result<FetchedManifest, FetchError> {
    let path = crate::manifest::manifest_path(&root);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(FetchedManifest {
            bytes: Bytes::from(bytes),
            root,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FetchError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(FetchError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(
            FetchError::Timeout {
                locator: "x".into(),
                after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        for status in [500, 502, 408, 429] {
            assert!(
                FetchError::Http {
                    status,
                    url: "u".into()
                }
                .is_retryable()
            );
        }
        for status in [400, 401, 403, 404] {
            assert!(
                !FetchError::Http {
                    status,
                    url: "u".into()
                }
                .is_retryable()
            );
        }
        assert!(!FetchError::NotFound("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_capped_keeps_diagnostics() {
        let items: Vec<Enumerated> = vec![
            Ok(Candidate::new(SourceKind::Filesystem, "a")),
            Err(SourceDiagnostic::new(SourceKind::Filesystem, "bad", "missing")),
            Ok(Candidate::new(SourceKind::Filesystem, "b")),
            Ok(Candidate::new(SourceKind::Filesystem, "c")),
            Err(SourceDiagnostic::new(SourceKind::Filesystem, "worse", "missing")),
        ];
        let out: Vec<_> = capped(stream::iter(items).boxed(), SourceKind::Filesystem, 2)
            .collect()
            .await;

        let oks: Vec<_> = out.iter().filter_map(|i| i.as_ref().ok()).collect();
        assert_eq!(oks.len(), 2);
        assert_eq!(out.iter().filter(|i| i.is_err()).count(), 2);
    }

    #[test]
    fn test_source_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SourceKind::DirectUrl).unwrap(),
            "\"directUrl\""
        );
        let kind: SourceKind = serde_json::from_str("\"registry\"").unwrap();
        assert_eq!(kind, SourceKind::Registry);
    }
}
