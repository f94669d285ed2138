use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    Candidate, ContentStore, Enumerated, FetchError, FetchedManifest, HttpFetcher,
    SourceDiagnostic, SourceKind, SourceProbe, capped, read_local_manifest,
};
use crate::manifest::{MAX_MANIFEST_SIZE, PLUGIN_CONFIG_DIR, PLUGIN_MANIFEST_FILE};

pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Release asset names recognized as packaged plugins.
pub const RELEASE_ASSET_SUFFIXES: &[&str] = &[".plugin.tar.gz", ".claude-plugin.tar.gz"];

const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Parsed repository locator.
///
/// Accepted forms: `github:org/repo[@ref]` and `https://host/org/repo[.git][@ref]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepository {
    pub org: String,
    pub repo: String,
    pub git_ref: Option<String>,
    pub clone_url: String,
    /// Hosted on github.com, so the raw-content and release APIs apply.
    pub github: bool,
}

impl GitRepository {
    pub fn parse(locator: &str) -> Result<Self, FetchError> {
        if let Some(rest) = locator.strip_prefix("github:") {
            let (path, git_ref) = split_ref(rest);
            let (org, repo) = split_org_repo(path)
                .ok_or_else(|| FetchError::Unsupported(format!("expected org/repo: {locator}")))?;
            return Self::build(
                org,
                repo,
                git_ref,
                format!("https://github.com/{org}/{repo}.git"),
                true,
            );
        }

        if locator.starts_with("https://") {
            let (url, git_ref) = split_ref(locator);
            let parsed = url::Url::parse(url)
                .map_err(|e| FetchError::Unsupported(format!("{locator}: {e}")))?;
            let segments: Vec<_> = parsed
                .path_segments()
                .map(|s| s.filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            let [.., org, repo] = segments.as_slice() else {
                return Err(FetchError::Unsupported(format!(
                    "expected https://host/org/repo: {locator}"
                )));
            };
            let repo = repo.trim_end_matches(".git");
            let github = parsed
                .host_str()
                .is_some_and(|h| h.eq_ignore_ascii_case("github.com"));
            return Self::build(org, repo, git_ref, url.to_string(), github);
        }

        Err(FetchError::Unsupported(format!(
            "expected 'github:org/repo[@ref]' or an https repository URL: {locator}"
        )))
    }

    fn build(
        org: &str,
        repo: &str,
        git_ref: Option<&str>,
        clone_url: String,
        github: bool,
    ) -> Result<Self, FetchError> {
        for (what, value) in [("org", org), ("repo", repo)] {
            if !is_safe_component(value) {
                return Err(FetchError::Unsupported(format!("invalid {what} '{value}'")));
            }
        }
        if let Some(r) = git_ref
            && (r.is_empty() || r.starts_with('-') || r.contains("..") || !r.chars().all(is_ref_char))
        {
            return Err(FetchError::Unsupported(format!("invalid git ref '{r}'")));
        }
        Ok(Self {
            org: org.to_string(),
            repo: repo.to_string(),
            git_ref: git_ref.map(String::from),
            clone_url,
            github,
        })
    }

    /// Strategies tried in order for this repository.
    fn strategies(&self) -> &'static [Strategy] {
        if self.github {
            &[Strategy::BranchManifest, Strategy::ReleaseAsset]
        } else {
            &[Strategy::ShallowClone]
        }
    }

    pub fn raw_manifest_url(&self, raw_base: &str) -> String {
        format!(
            "{}/{}/{}/{}/{PLUGIN_CONFIG_DIR}/{PLUGIN_MANIFEST_FILE}",
            raw_base.trim_end_matches('/'),
            self.org,
            self.repo,
            self.git_ref.as_deref().unwrap_or("HEAD"),
        )
    }

    pub fn latest_release_url(&self, api_base: &str) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            api_base.trim_end_matches('/'),
            self.org,
            self.repo
        )
    }
}

/// `org/repo@v1` → (`org/repo`, `Some("v1")`). Only the last `@` after the
/// final `/` is a ref separator.
fn split_ref(value: &str) -> (&str, Option<&str>) {
    let tail_start = value.rfind('/').map_or(0, |i| i + 1);
    match value[tail_start..].rfind('@') {
        Some(at) => {
            let at = tail_start + at;
            (&value[..at], Some(&value[at + 1..]))
        }
        None => (value, None),
    }
}

fn split_org_repo(path: &str) -> Option<(&str, &str)> {
    let (org, repo) = path.split_once('/')?;
    (!org.is_empty() && !repo.is_empty() && !repo.contains('/')).then_some((org, repo))
}

fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Shallow clone once the raw manifest on the default branch (or the
    /// pinned ref) confirms the repository carries a plugin.
    BranchManifest,
    /// Packaged plugin attached to the latest release.
    ReleaseAsset,
    /// Shallow clone without probing, for hosts other than GitHub.
    ShallowClone,
}

/// Plugins hosted in Git repositories.
pub struct GitProbe {
    repositories: Vec<String>,
    http: HttpFetcher,
    store: ContentStore,
    max_candidates: usize,
    raw_base: String,
    api_base: String,
}

impl GitProbe {
    pub fn new(
        repositories: Vec<String>,
        http: HttpFetcher,
        store: ContentStore,
        max_candidates: usize,
    ) -> Self {
        Self {
            repositories,
            http,
            store,
            max_candidates,
            raw_base: DEFAULT_RAW_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Overrides the raw-content and API hosts used for GitHub repositories.
    pub fn with_endpoints(mut self, raw_base: impl Into<String>, api_base: impl Into<String>) -> Self {
        self.raw_base = raw_base.into();
        self.api_base = api_base.into();
        self
    }

    async fn try_strategy(
        &self,
        strategy: Strategy,
        repository: &GitRepository,
        locator: &str,
    ) -> Result<FetchedManifest, FetchError> {
        match strategy {
            Strategy::BranchManifest => {
                let url = repository.raw_manifest_url(&self.raw_base);
                self.http
                    .get_bytes(&url, None, MAX_MANIFEST_SIZE as u64 * 4)
                    .await?;
                let root = self.clone_repository(repository, locator).await?;
                read_local_manifest(root).await
            }
            Strategy::ShallowClone => {
                let root = self.clone_repository(repository, locator).await?;
                read_local_manifest(root).await
            }
            Strategy::ReleaseAsset => {
                let release: Release = self
                    .http
                    .get_json(&repository.latest_release_url(&self.api_base), None)
                    .await?;
                let asset = release
                    .assets
                    .iter()
                    .find(|a| RELEASE_ASSET_SUFFIXES.iter().any(|s| a.name.ends_with(s)))
                    .ok_or_else(|| {
                        FetchError::NotFound(format!("no plugin asset in latest release of {locator}"))
                    })?;
                debug!(locator, asset = %asset.name, "Using release asset");
                let root = self
                    .store
                    .fetch_archive(&self.http, &asset.browser_download_url, None)
                    .await?;
                read_local_manifest(root).await
            }
        }
    }

    async fn clone_repository(
        &self,
        repository: &GitRepository,
        locator: &str,
    ) -> Result<PathBuf, FetchError> {
        let target = self.store.git_dir(locator);
        let parent = target
            .parent()
            .ok_or_else(|| FetchError::Git("store has no parent directory".into()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let staging = tempfile::Builder::new()
            .prefix(".clone-")
            .tempdir_in(&parent)?;
        let checkout = staging.path().join("repo");

        tokio::time::timeout(
            GIT_CLONE_TIMEOUT,
            run_git_clone(&repository.clone_url, repository.git_ref.as_deref(), &checkout),
        )
        .await
        .map_err(|_| FetchError::Timeout {
            locator: locator.to_string(),
            after: GIT_CLONE_TIMEOUT,
        })??;

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&checkout, &target).await?;
        info!(locator, path = %target.display(), "Cloned plugin repository");
        Ok(target)
    }
}

async fn run_git_clone(url: &str, git_ref: Option<&str>, dest: &Path) -> Result<(), FetchError> {
    let mut cmd = Command::new("git");
    cmd.env_clear();
    for var in ["PATH", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    cmd.env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .args(["clone", "--depth=1"]);
    if let Some(r) = git_ref {
        cmd.args(["--branch", r]);
    }
    cmd.arg("--").arg(url).arg(dest);

    let output = cmd
        .output()
        .await
        .map_err(|e| FetchError::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(FetchError::Git(format!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl SourceProbe for GitProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    fn describe(&self) -> String {
        format!("git ({} repositories)", self.repositories.len())
    }

    fn enumerate(&self) -> BoxStream<'_, Enumerated> {
        let items = stream::iter(self.repositories.iter().map(|locator| {
            GitRepository::parse(locator)
                .map(|_| Candidate::new(SourceKind::Git, locator.clone()))
                .map_err(|e| SourceDiagnostic::new(SourceKind::Git, locator.clone(), e))
        }))
        .boxed();
        capped(items, SourceKind::Git, self.max_candidates)
    }

    async fn fetch_manifest(&self, candidate: &Candidate) -> Result<FetchedManifest, FetchError> {
        let repository = GitRepository::parse(&candidate.locator)?;

        let mut last_error = None;
        for &strategy in repository.strategies() {
            match self
                .try_strategy(strategy, &repository, &candidate.locator)
                .await
            {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    warn!(
                        locator = %candidate.locator,
                        strategy = ?strategy,
                        error = %e,
                        "Git fetch strategy failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::NotFound(candidate.locator.clone())))
    }
}
