//! Dependency resolution.
//!
//! Produces an [`InstallPlan`] listing what is missing. Installing is left to
//! the host; a plugin with a non-empty plan waits in the registry until it is
//! re-resolved.

mod probes;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use semver::Version;
use serde::Serialize;
use tracing::debug;

pub use probes::{
    DependencyProbe, NpmPackageProbe, PythonPackageProbe, SystemCommandProbe, extract_version,
};

use crate::manifest::{DependencyKind, DependencySpec, PluginManifest, VersionConstraint};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DependencyStatus {
    /// `version` is `None` when it was not needed or could not be detected.
    Present { version: Option<Version> },
    Missing,
    VersionMismatch { found: Version },
}

impl DependencyStatus {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallStep {
    pub kind: DependencyKind,
    pub name: String,
    pub constraint: VersionConstraint,
    pub status: DependencyStatus,
}

/// Missing dependencies ordered by (kind, name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    pub steps: Vec<InstallStep>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps_for(&self, kind: DependencyKind) -> impl Iterator<Item = &InstallStep> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }
}

impl std::fmt::Display for InstallPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<_> = self
            .steps
            .iter()
            .map(|s| format!("{}:{}@{}", s.kind, s.name, s.constraint))
            .collect();
        write!(f, "{}", steps.join(", "))
    }
}

/// Parses `1`, `1.2` and `1.2.3` (with optional prerelease) into a version.
pub fn parse_lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let numeric: Vec<u64> = raw
        .split('.')
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;
    match numeric.as_slice() {
        [major] => Some(Version::new(*major, 0, 0)),
        [major, minor] => Some(Version::new(*major, *minor, 0)),
        _ => None,
    }
}

pub struct DependencyResolver {
    probes: HashMap<DependencyKind, Arc<dyn DependencyProbe>>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::empty()
            .with_probe(Arc::new(SystemCommandProbe::new()))
            .with_probe(Arc::new(NpmPackageProbe))
            .with_probe(Arc::new(PythonPackageProbe))
    }

    /// A resolver without probes; every dependency is reported missing.
    pub fn empty() -> Self {
        Self {
            probes: HashMap::new(),
        }
    }

    /// Registers `probe` for its kind, replacing any previous one.
    pub fn with_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.probes.insert(probe.kind(), probe);
        self
    }

    /// Probes every declared dependency of the plugin at `root`.
    pub async fn resolve(&self, manifest: &PluginManifest, root: &Path) -> InstallPlan {
        let declared = declared_dependencies(manifest, root).await;

        let statuses = join_all(declared.iter().map(|spec| async move {
            match self.probes.get(&spec.kind) {
                Some(probe) => probe.probe(spec, root).await,
                None => DependencyStatus::Missing,
            }
        }))
        .await;

        let steps: Vec<_> = declared
            .into_iter()
            .zip(statuses)
            .filter(|(_, status)| !status.is_satisfied())
            .map(|(spec, status)| InstallStep {
                kind: spec.kind,
                name: spec.name,
                constraint: spec.constraint,
                status,
            })
            .collect();

        if !steps.is_empty() {
            debug!(plugin = %manifest.name, missing = steps.len(), "Unsatisfied dependencies");
        }
        InstallPlan { steps }
    }
}

/// Manifest dependencies merged with `package.json` and `requirements.txt`
/// at the plugin root, sorted by installation order. Manifest entries win.
pub async fn declared_dependencies(manifest: &PluginManifest, root: &Path) -> Vec<DependencySpec> {
    let mut merged: BTreeMap<(DependencyKind, String), DependencySpec> = BTreeMap::new();

    let from_files = [
        read_package_json(root).await,
        read_requirements(root).await,
    ];
    for spec in from_files.into_iter().flatten() {
        merged.insert((spec.kind, spec.name.clone()), spec);
    }
    for spec in &manifest.dependencies {
        merged.insert((spec.kind, spec.name.clone()), spec.clone());
    }

    merged.into_values().collect()
}

fn lenient_constraint(raw: &str) -> VersionConstraint {
    VersionConstraint::parse(raw).unwrap_or_else(|e| {
        debug!(constraint = raw, error = %e, "Unrecognized constraint, accepting any version");
        VersionConstraint::Any
    })
}

async fn read_package_json(root: &Path) -> Vec<DependencySpec> {
    let Ok(content) = tokio::fs::read(root.join("package.json")).await else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&content) else {
        debug!(root = %root.display(), "Ignoring malformed package.json");
        return Vec::new();
    };

    value
        .get("dependencies")
        .and_then(|d| d.as_object())
        .map(|deps| {
            deps.iter()
                .map(|(name, constraint)| {
                    DependencySpec::new(
                        DependencyKind::Npm,
                        name.clone(),
                        lenient_constraint(constraint.as_str().unwrap_or("*")),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn read_requirements(root: &Path) -> Vec<DependencySpec> {
    let Ok(content) = tokio::fs::read_to_string(root.join("requirements.txt")).await else {
        return Vec::new();
    };
    content.lines().filter_map(parse_requirement).collect()
}

/// `requests==2.31.0`, `pyyaml>=6`, `rich[jupyter]~=13.0`, `click`.
fn parse_requirement(line: &str) -> Option<DependencySpec> {
    let line = line.split('#').next()?.split(';').next()?.trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }

    let split = line
        .find(|c: char| matches!(c, '=' | '>' | '<' | '~' | '!' | ' '))
        .unwrap_or(line.len());
    let (name, constraint) = line.split_at(split);
    let name = name.split('[').next()?.trim();
    if name.is_empty() {
        return None;
    }

    Some(DependencySpec::new(
        DependencyKind::Python,
        name,
        lenient_constraint(constraint.trim()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestParser;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FixedProbe {
        kind: DependencyKind,
        present: &'static [&'static str],
    }

    #[async_trait]
    impl DependencyProbe for FixedProbe {
        fn kind(&self) -> DependencyKind {
            self.kind
        }

        async fn probe(&self, spec: &DependencySpec, _root: &Path) -> DependencyStatus {
            if self.present.contains(&spec.name.as_str()) {
                DependencyStatus::Present { version: None }
            } else {
                DependencyStatus::Missing
            }
        }
    }

    fn resolver(present: &'static [&'static str]) -> DependencyResolver {
        DependencyResolver::empty()
            .with_probe(Arc::new(FixedProbe {
                kind: DependencyKind::System,
                present,
            }))
            .with_probe(Arc::new(FixedProbe {
                kind: DependencyKind::Npm,
                present,
            }))
            .with_probe(Arc::new(FixedProbe {
                kind: DependencyKind::Python,
                present,
            }))
    }

    fn manifest(deps: &str) -> PluginManifest {
        ManifestParser::new()
            .parse(format!(r#"{{"name":"p","version":"1.0.0","dependencies":{deps}}}"#).as_bytes())
            .unwrap()
            .manifest
    }

    fn plan_names(plan: &InstallPlan) -> Vec<String> {
        plan.steps
            .iter()
            .map(|s| format!("{}:{}", s.kind, s.name))
            .collect()
    }

    #[tokio::test]
    async fn test_plan_order_is_by_kind_then_name() {
        let dir = tempdir().unwrap();
        let plan = resolver(&[])
            .resolve(
                &manifest(r#"{"pip:requests":"*","npm:zx":"*","jq":"*","docker":"*"}"#),
                dir.path(),
            )
            .await;
        assert_eq!(
            plan_names(&plan),
            ["system:docker", "system:jq", "npm:zx", "python:requests"]
        );
    }

    #[tokio::test]
    async fn test_plan_independent_of_declaration_order() {
        let dir = tempdir().unwrap();
        let r = resolver(&[]);
        let a = r
            .resolve(&manifest(r#"{"npm:b":"*","jq":"*","npm:a":"*"}"#), dir.path())
            .await;
        let b = r
            .resolve(&manifest(r#"{"npm:a":"*","npm:b":"*","jq":"*"}"#), dir.path())
            .await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_satisfied_dependencies_are_omitted() {
        let dir = tempdir().unwrap();
        let plan = resolver(&["jq"])
            .resolve(&manifest(r#"{"jq":"*","git":"*"}"#), dir.path())
            .await;
        assert_eq!(plan_names(&plan), ["system:git"]);

        let empty = resolver(&["jq"])
            .resolve(&manifest(r#"{"jq":"*"}"#), dir.path())
            .await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_declaration_files_merge() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies":{"zx":"^7.0.0","chalk":"latest"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "# tools\nrequests==2.31.0\nrich[jupyter]>=13 ; python_version > '3.8'\n-r other.txt\n",
        )
        .unwrap();

        let specs = declared_dependencies(&manifest(r#"{"npm:zx":"^8"}"#), dir.path()).await;
        let rendered: Vec<_> = specs
            .iter()
            .map(|s| format!("{}:{}@{}", s.kind, s.name, s.constraint))
            .collect();
        assert_eq!(
            rendered,
            [
                "npm:chalk@*",
                "npm:zx@^8",
                "python:requests@=2.31.0",
                "python:rich@>=13",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_probe_reports_missing() {
        let dir = tempdir().unwrap();
        let plan = DependencyResolver::empty()
            .resolve(&manifest(r#"{"jq":"*"}"#), dir.path())
            .await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0].status, DependencyStatus::Missing);
    }

    #[test]
    fn test_parse_lenient_version() {
        assert_eq!(parse_lenient_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_lenient_version("6.0"), Some(Version::new(6, 0, 0)));
        assert_eq!(parse_lenient_version("7"), Some(Version::new(7, 0, 0)));
        assert_eq!(parse_lenient_version("1.2.3.4"), None);
        assert_eq!(parse_lenient_version("abc"), None);
    }
}
