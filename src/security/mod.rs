//! Static risk scanning, content fingerprinting and signature verification.
//!
//! Findings are advisory. The only fatal outcome is a declared signature that
//! does not verify against the computed checksum.

mod checksum;
mod patterns;
mod signature;

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub use checksum::{COMPONENT_PATHS, IGNORED_DIRS, component_files, compute_checksum, tree_hash};
pub use patterns::{MAX_SCANNED_FILE_SIZE, SCANNED_EXTENSIONS, is_scanned_extension};
pub use signature::{SIGNATURE_ALGORITHM, verify_signature};

use crate::manifest::{PluginManifest, ValidatedManifest};

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Signature does not match checksum {checksum}")]
    SignatureMismatch { checksum: String },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One advisory match of a risk pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SecurityFinding {
    /// Path relative to the plugin root, `/` separated.
    pub file: String,
    /// 1-based.
    pub line: usize,
    pub pattern: &'static str,
}

impl std::fmt::Display for SecurityFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityReport {
    pub checksum: String,
    /// Ordered by (file, line, pattern).
    pub findings: Vec<SecurityFinding>,
    pub signature_verified: bool,
}

impl SecurityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// A plugin whose manifest parsed and whose tree passed the security scan.
#[derive(Debug, Clone)]
pub struct ValidatedPlugin {
    pub manifest: PluginManifest,
    pub root_path: PathBuf,
    pub checksum: String,
    pub security_findings: Vec<SecurityFinding>,
    pub signature_verified: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityScanner;

impl SecurityScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scans `root` on the blocking pool.
    pub async fn scan(
        &self,
        root: &Path,
        manifest: &ValidatedManifest,
    ) -> Result<SecurityReport, SecurityError> {
        let root = root.to_path_buf();
        let manifest = manifest.clone();
        let scanner = *self;
        tokio::task::spawn_blocking(move || scanner.scan_blocking(&root, &manifest))
            .await
            .map_err(|e| SecurityError::Io(std::io::Error::other(e)))?
    }

    /// Scans `root` and pairs the result with its manifest.
    pub async fn validate(
        &self,
        manifest: ValidatedManifest,
        root: &Path,
    ) -> Result<ValidatedPlugin, SecurityError> {
        let report = self.scan(root, &manifest).await?;
        Ok(ValidatedPlugin {
            manifest: manifest.manifest,
            root_path: root.to_path_buf(),
            checksum: report.checksum,
            security_findings: report.findings,
            signature_verified: report.signature_verified,
        })
    }

    pub fn scan_blocking(
        &self,
        root: &Path,
        manifest: &ValidatedManifest,
    ) -> Result<SecurityReport, SecurityError> {
        let checksum = compute_checksum(&manifest.canonical_bytes, root)?;
        let findings = self.findings(root)?;

        let signature_verified = match &manifest.manifest.signature {
            Some(signature) => {
                verify_signature(signature, &checksum)?;
                true
            }
            None => false,
        };

        if !findings.is_empty() {
            warn!(
                plugin = %manifest.manifest.name,
                count = findings.len(),
                "Plugin contains risky patterns"
            );
        }

        Ok(SecurityReport {
            checksum,
            findings,
            signature_verified,
        })
    }

    /// Every risk pattern match under `root`, sorted.
    pub fn findings(&self, root: &Path) -> std::io::Result<Vec<SecurityFinding>> {
        let mut findings = Vec::new();

        for (relative, path) in scannable_files(root)? {
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };

            for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
                let Ok(line) = line else { break };
                let line = String::from_utf8_lossy(&line);
                for pattern in patterns::match_line(&line) {
                    findings.push(SecurityFinding {
                        file: relative.clone(),
                        line: index + 1,
                        pattern,
                    });
                }
            }
        }

        findings.sort();
        Ok(findings)
    }
}

fn scannable_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| IGNORED_DIRS.contains(&n))
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let scanned = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(is_scanned_extension);
        if !scanned {
            continue;
        }
        let too_large = entry
            .metadata()
            .map(|m| m.len() > MAX_SCANNED_FILE_SIZE)
            .unwrap_or(true);
        if too_large {
            debug!(path = %entry.path().display(), "Skipping oversized file");
            continue;
        }
        if let Some(relative) = checksum::relative_path(root, entry.path()) {
            files.push((relative, entry.into_path()));
        }
    }

    Ok(files)
}
