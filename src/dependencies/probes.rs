use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use semver::Version;
use tokio::process::Command;
use tracing::debug;

use super::{DependencyStatus, parse_lenient_version};
use crate::manifest::{DependencyKind, DependencySpec};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether one kind of dependency is satisfied for a plugin root.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn kind(&self) -> DependencyKind;

    async fn probe(&self, spec: &DependencySpec, root: &Path) -> DependencyStatus;
}

fn evaluate(spec: &DependencySpec, found: Option<Version>) -> DependencyStatus {
    match found {
        Some(version) if !spec.constraint.matches(&version) => {
            DependencyStatus::VersionMismatch { found: version }
        }
        version => DependencyStatus::Present { version },
    }
}

/// Executables on `PATH`, version-checked through `<cmd> --version`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandProbe {
    search_path: Option<OsString>,
}

impl SystemCommandProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Searches `paths` instead of the process `PATH`.
    pub fn with_search_path(paths: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(paths.into()),
        }
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(name, Some(paths), cwd).ok()
            }
            None => which::which(name).ok(),
        }
    }

    async fn installed_version(path: &Path) -> Option<Version> {
        let output = tokio::time::timeout(
            VERSION_PROBE_TIMEOUT,
            Command::new(path)
                .arg("--version")
                .stdin(std::process::Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        extract_version(&text)
    }
}

/// First `MAJOR.MINOR[.PATCH]` in command output.
pub fn extract_version(text: &str) -> Option<Version> {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)?").expect("valid version regex"));
    re.find(text).and_then(|m| parse_lenient_version(m.as_str()))
}

#[async_trait]
impl DependencyProbe for SystemCommandProbe {
    fn kind(&self) -> DependencyKind {
        DependencyKind::System
    }

    async fn probe(&self, spec: &DependencySpec, _root: &Path) -> DependencyStatus {
        let Some(path) = self.locate(&spec.name) else {
            return DependencyStatus::Missing;
        };
        if spec.constraint.is_any() {
            return DependencyStatus::Present { version: None };
        }

        let version = Self::installed_version(&path).await;
        if version.is_none() {
            debug!(command = %spec.name, "Could not determine version, assuming present");
        }
        evaluate(spec, version)
    }
}

/// Packages installed in the plugin's `node_modules`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpmPackageProbe;

#[async_trait]
impl DependencyProbe for NpmPackageProbe {
    fn kind(&self) -> DependencyKind {
        DependencyKind::Npm
    }

    async fn probe(&self, spec: &DependencySpec, root: &Path) -> DependencyStatus {
        let package_json = root
            .join("node_modules")
            .join(&spec.name)
            .join("package.json");

        let Ok(content) = tokio::fs::read(&package_json).await else {
            return DependencyStatus::Missing;
        };
        let version = serde_json::from_slice::<serde_json::Value>(&content)
            .ok()
            .and_then(|v| v.get("version")?.as_str().and_then(parse_lenient_version));
        evaluate(spec, version)
    }
}

/// Packages installed in the plugin's `.venv`, found by their `dist-info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonPackageProbe;

impl PythonPackageProbe {
    fn normalize(name: &str) -> String {
        name.to_ascii_lowercase().replace(['-', '.'], "_")
    }

    fn installed_version(root: &Path, name: &str) -> Option<Option<Version>> {
        let wanted = Self::normalize(name);
        let lib = root.join(".venv").join("lib");

        for interpreter in std::fs::read_dir(lib).ok()?.flatten() {
            let site_packages = interpreter.path().join("site-packages");
            let Ok(entries) = std::fs::read_dir(&site_packages) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(stem) = file_name
                    .to_str()
                    .and_then(|n| n.strip_suffix(".dist-info"))
                else {
                    continue;
                };
                let Some((package, version)) = stem.split_once('-') else {
                    continue;
                };
                if Self::normalize(package) == wanted {
                    return Some(parse_lenient_version(version));
                }
            }
        }
        None
    }
}

#[async_trait]
impl DependencyProbe for PythonPackageProbe {
    fn kind(&self) -> DependencyKind {
        DependencyKind::Python
    }

    async fn probe(&self, spec: &DependencySpec, root: &Path) -> DependencyStatus {
        let root = root.to_path_buf();
        let name = spec.name.clone();
        let found = tokio::task::spawn_blocking(move || Self::installed_version(&root, &name))
            .await
            .ok()
            .flatten();

        match found {
            Some(version) => evaluate(spec, version),
            None => DependencyStatus::Missing,
        }
    }
}
