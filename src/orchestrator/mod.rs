//! End-to-end discovery.
//!
//! Every candidate runs through `Scanning → Validating → Resolving → Loading
//! → Registered` on its own; a failure at any stage drops only that
//! candidate. Candidates from all sources run concurrently, while registry
//! writes are serialized by [`PluginRegistry`].

mod pipeline;
mod watch;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use pipeline::{CandidateFailure, FailureClass, FailureReason, Stage};
pub use watch::{HotReloadHandle, ReloadEvent};

use crate::cache::DiscoveryCache;
use crate::components::ComponentLoader;
use crate::config::ResolverConfig;
use crate::dependencies::DependencyResolver;
use crate::manifest::ManifestParser;
use crate::registry::{
    PluginOrigin, PluginRegistry, PluginStatus, RegisterOutcome, RegistryEntry, RegistryError,
};
use crate::security::SecurityScanner;
use crate::sources::{
    Candidate, ContentStore, DirectUrlProbe, FetchedManifest, FilesystemProbe, GitProbe,
    HttpFetcher, RegistryProbe, SourceDiagnostic, SourceKind, SourceProbe,
};

/// A candidate that made it into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPlugin {
    pub name: String,
    pub version: semver::Version,
    #[serde(serialize_with = "serialize_display")]
    pub outcome: RegisterOutcome,
    pub status: PluginStatus,
    pub origin: PluginOrigin,
}

/// A candidate left alone because nothing changed since the last pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCandidate {
    pub source_kind: SourceKind,
    pub locator: String,
    pub plugin: String,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Ordered by plugin name.
    pub registered: Vec<RegisteredPlugin>,
    pub skipped: Vec<SkippedCandidate>,
    /// Ordered by locator.
    pub failures: Vec<CandidateFailure>,
    pub diagnostics: Vec<SourceDiagnostic>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.diagnostics.is_empty()
    }

    pub fn failures_of(&self, class: FailureClass) -> impl Iterator<Item = &CandidateFailure> {
        self.failures.iter().filter(move |f| f.class() == class)
    }

    pub fn registered_names(&self) -> impl Iterator<Item = &str> {
        self.registered.iter().map(|r| r.name.as_str())
    }
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: std::fmt::Display,
{
    serializer.collect_str(value)
}

enum CandidateOutcome {
    Registered(RegisteredPlugin),
    Skipped(SkippedCandidate),
    Failed(CandidateFailure),
}

/// Where a pipeline run came from and how it may be short-circuited.
struct PipelineInput<'a> {
    origin: PluginOrigin,
    priority: i32,
    cancel: Option<&'a CancellationToken>,
    /// Skip dependency and component work when the fingerprint matches the
    /// cache and the registry.
    allow_skip: bool,
}

type StageResult<T> = Result<T, (Stage, FailureReason)>;

pub struct Orchestrator {
    config: ResolverConfig,
    registry: Arc<PluginRegistry>,
    sources: Vec<Arc<dyn SourceProbe>>,
    parser: ManifestParser,
    scanner: SecurityScanner,
    resolver: DependencyResolver,
    loader: ComponentLoader,
    cache: DiscoveryCache,
}

impl Orchestrator {
    /// An orchestrator without sources and with an in-memory cache.
    pub fn new(config: ResolverConfig, registry: Arc<PluginRegistry>) -> Self {
        let cache = DiscoveryCache::in_memory(config.cache_ttl());
        Self {
            config,
            registry,
            sources: Vec::new(),
            parser: ManifestParser::new(),
            scanner: SecurityScanner::new(),
            resolver: DependencyResolver::new(),
            loader: ComponentLoader::new(),
            cache,
        }
    }

    /// Builds every source the configuration names and loads the on-disk
    /// discovery cache.
    pub async fn from_config(
        config: ResolverConfig,
        registry: Arc<PluginRegistry>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let http = HttpFetcher::new(config.retry_policy())?;
        let store = ContentStore::new(config.store_dir());
        let cap = config.max_candidates_per_source;
        let cache = DiscoveryCache::load(&config.cache_dir(), config.cache_ttl()).await;

        let mut sources: Vec<Arc<dyn SourceProbe>> = Vec::new();
        if !config.plugin_dirs.is_empty() {
            sources.push(Arc::new(FilesystemProbe::new(config.plugin_dirs.clone(), cap)));
        }
        if !config.git_repositories.is_empty() {
            let mut git = GitProbe::new(
                config.git_repositories.clone(),
                http.clone(),
                store.clone(),
                cap,
            );
            if let (Some(raw), Some(api)) = (&config.git_raw_base, &config.git_api_base) {
                git = git.with_endpoints(raw.clone(), api.clone());
            }
            sources.push(Arc::new(git));
        }
        for endpoint in &config.registries {
            sources.push(Arc::new(RegistryProbe::new(
                endpoint.clone(),
                http.clone(),
                store.clone(),
                cap,
            )));
        }
        for locator in &config.manifest_urls {
            sources.push(Arc::new(DirectUrlProbe::new(
                locator.clone(),
                http.clone(),
                store.clone(),
            )));
        }

        debug!(sources = sources.len(), "Built discovery sources");
        Ok(Self {
            sources,
            cache,
            ..Self::new(config, registry)
        })
    }

    pub fn with_source(mut self, probe: Arc<dyn SourceProbe>) -> Self {
        self.sources.push(probe);
        self
    }

    pub fn with_resolver(mut self, resolver: DependencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_cache(mut self, cache: DiscoveryCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn sources(&self) -> impl Iterator<Item = &dyn SourceProbe> {
        self.sources.iter().map(|s| s.as_ref())
    }

    /// One full discovery pass over every source.
    pub async fn discover(&self, cancel: CancellationToken) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        info!(sources = self.sources.len(), "Starting plugin discovery");

        let enumerated = join_all(self.sources.iter().map(|source| async move {
            let items: Vec<_> = source.enumerate().collect().await;
            debug!(source = %source.describe(), items = items.len(), "Enumerated source");
            (Arc::clone(source), items)
        }))
        .await;

        let mut candidates = Vec::new();
        for (source, items) in enumerated {
            for item in items {
                match item {
                    Ok(candidate) => candidates.push((Arc::clone(&source), candidate)),
                    Err(diagnostic) => {
                        warn!(%diagnostic, "Source diagnostic");
                        report.diagnostics.push(diagnostic);
                    }
                }
            }
        }

        let cancel = &cancel;
        let outcomes: Vec<_> = stream::iter(candidates)
            .map(|(source, candidate)| async move {
                self.process_candidate(source.as_ref(), candidate, cancel)
                    .await
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                CandidateOutcome::Registered(plugin) => report.registered.push(plugin),
                CandidateOutcome::Skipped(skipped) => report.skipped.push(skipped),
                CandidateOutcome::Failed(failure) => {
                    warn!(
                        locator = %failure.locator,
                        source = %failure.source_kind,
                        stage = %failure.stage,
                        reason = %failure.reason,
                        "Dropped plugin candidate"
                    );
                    report.failures.push(failure);
                }
            }
        }

        if let Err(e) = self.cache.persist().await {
            warn!(error = %e, "Failed to persist discovery cache");
        }

        report.registered.sort_by(|a, b| a.name.cmp(&b.name));
        report.skipped.sort_by(|a, b| a.locator.cmp(&b.locator));
        report.failures.sort_by(|a, b| a.locator.cmp(&b.locator));
        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            diagnostics = report.diagnostics.len(),
            "Plugin discovery finished"
        );
        report
    }

    async fn process_candidate(
        &self,
        source: &dyn SourceProbe,
        candidate: Candidate,
        cancel: &CancellationToken,
    ) -> CandidateOutcome {
        let kind = candidate.source_kind;
        let locator = candidate.locator.clone();
        let fail = |(stage, reason): (Stage, FailureReason)| {
            CandidateOutcome::Failed(CandidateFailure::new(kind, locator.clone(), stage, reason))
        };

        if cancel.is_cancelled() {
            return fail((Stage::Scanning, FailureReason::Cancelled));
        }

        let force = self.config.force_refresh;
        let snapshot = self.registry.snapshot().await;
        if !self.cache.should_rescan(&locator, force).await
            && let Some(entry) = snapshot.find_by_locator(&locator)
        {
            debug!(%locator, plugin = entry.name(), "Source unchanged, skipping");
            return CandidateOutcome::Skipped(SkippedCandidate {
                source_kind: kind,
                locator: locator.clone(),
                plugin: entry.name().to_string(),
            });
        }

        let fetched = match source.fetch_manifest(&candidate).await {
            Ok(fetched) => fetched,
            Err(e) => return fail((Stage::Scanning, e.into())),
        };

        let input = PipelineInput {
            origin: PluginOrigin::new(kind, locator.clone()),
            priority: self.config.priority_for(kind),
            cancel: Some(cancel),
            allow_skip: !force,
        };
        match self.run_pipeline(fetched, input).await {
            Ok(outcome) => outcome,
            Err(failure) => fail(failure),
        }
    }

    /// Validating → Resolving → Loading → Registered.
    async fn run_pipeline(
        &self,
        fetched: FetchedManifest,
        input: PipelineInput<'_>,
    ) -> StageResult<CandidateOutcome> {
        let locator = input.origin.locator.as_str();
        let check = |stage: Stage| match input.cancel {
            Some(cancel) if cancel.is_cancelled() => Err((stage, FailureReason::Cancelled)),
            _ => Ok(()),
        };

        check(Stage::Validating)?;
        let manifest = self
            .parser
            .parse(&fetched.bytes)
            .map_err(|e| (Stage::Validating, e.into()))?;
        let plugin = self
            .scanner
            .validate(manifest, &fetched.root)
            .await
            .map_err(|e| (Stage::Validating, e.into()))?;

        if input.allow_skip && self.cache.checksum_matches(locator, &plugin.checksum).await {
            let snapshot = self.registry.snapshot().await;
            let unchanged = snapshot.get(&plugin.manifest.name).is_some_and(|entry| {
                entry.checksum == plugin.checksum && entry.origin == input.origin
            });
            if unchanged {
                self.cache.record_scan(locator, &plugin.checksum).await;
                return Ok(CandidateOutcome::Skipped(SkippedCandidate {
                    source_kind: input.origin.source_kind,
                    locator: locator.to_string(),
                    plugin: plugin.manifest.name.clone(),
                }));
            }
        }

        check(Stage::Resolving)?;
        let install_plan = self.resolver.resolve(&plugin.manifest, &plugin.root_path).await;

        check(Stage::Loading)?;
        let component_set = self
            .loader
            .load(&plugin)
            .await
            .map_err(|e| (Stage::Loading, e.into()))?;

        check(Stage::Registered)?;
        let status = if install_plan.is_empty() {
            PluginStatus::Active
        } else {
            info!(
                plugin = %plugin.manifest.name,
                missing = %install_plan,
                "Plugin queued for dependencies"
            );
            PluginStatus::QueuedForDependencies
        };
        let checksum = plugin.checksum.clone();
        let entry = RegistryEntry {
            manifest: plugin.manifest,
            root_path: plugin.root_path,
            checksum: plugin.checksum,
            component_set,
            status,
            loaded_at: Utc::now(),
            origin: input.origin.clone(),
            priority: input.priority,
            install_plan,
            security_findings: plugin.security_findings,
        };
        let name = entry.manifest.name.clone();
        let version = entry.manifest.version.clone();

        let outcome = self
            .registry
            .register(entry)
            .await
            .map_err(|e| (Stage::Registered, e.into()))?;
        self.cache.record_scan(locator, &checksum).await;

        Ok(CandidateOutcome::Registered(RegisteredPlugin {
            name,
            version,
            outcome,
            status,
            origin: input.origin,
        }))
    }

    /// Re-enters a local plugin root at Validating. On failure the
    /// registered entry, if any, stays as it was.
    pub async fn revalidate(&self, root: &Path) -> Result<RegisterOutcome, CandidateFailure> {
        let snapshot = self.registry.snapshot().await;
        let (origin, priority) = match snapshot.find_by_root(root) {
            Some(entry) => (entry.origin.clone(), entry.priority),
            None => (
                PluginOrigin::new(SourceKind::Filesystem, root.display().to_string()),
                self.config.priority_for(SourceKind::Filesystem),
            ),
        };
        let kind = origin.source_kind;
        let locator = origin.locator.clone();
        let fail = |stage: Stage, reason: FailureReason| {
            CandidateFailure::new(kind, locator.clone(), stage, reason)
        };

        let fetched = crate::sources::read_local_manifest(root.to_path_buf())
            .await
            .map_err(|e| fail(Stage::Validating, e.into()))?;

        let input = PipelineInput {
            origin,
            priority,
            cancel: None,
            allow_skip: false,
        };
        match self.run_pipeline(fetched, input).await {
            Ok(CandidateOutcome::Registered(plugin)) => Ok(plugin.outcome),
            Ok(_) => Ok(RegisterOutcome::Unchanged),
            Err((stage, reason)) => Err(fail(stage, reason)),
        }
    }

    /// Re-resolves a registered plugin's dependencies, typically after the
    /// host ran its install plan.
    pub async fn recheck_dependencies(&self, name: &str) -> Result<PluginStatus, CandidateFailure> {
        let snapshot = self.registry.snapshot().await;
        let Some(entry) = snapshot.get(name) else {
            return Err(CandidateFailure::new(
                SourceKind::Filesystem,
                name,
                Stage::Resolving,
                RegistryError::NotRegistered(name.to_string()),
            ));
        };

        let install_plan = self.resolver.resolve(&entry.manifest, &entry.root_path).await;
        let status = if install_plan.is_empty() {
            PluginStatus::Active
        } else {
            PluginStatus::QueuedForDependencies
        };

        let updated = RegistryEntry {
            status,
            install_plan,
            loaded_at: Utc::now(),
            ..entry.clone()
        };
        let origin = updated.origin.clone();
        self.registry.register(updated).await.map_err(|e| {
            CandidateFailure::new(origin.source_kind, origin.locator, Stage::Registered, e)
        })?;

        info!(plugin = name, %status, "Rechecked plugin dependencies");
        Ok(status)
    }

    /// Marks a plugin whose dependency installation failed. The returned
    /// failure record is classed [`FailureClass::MissingDependency`].
    pub async fn report_install_failure(
        &self,
        name: &str,
        message: impl Into<String>,
    ) -> Result<CandidateFailure, RegistryError> {
        let snapshot = self.registry.snapshot().await;
        let entry = snapshot
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        let origin = entry.origin.clone();

        self.registry.set_status(name, PluginStatus::Failed).await?;

        let failure = CandidateFailure::new(
            origin.source_kind,
            origin.locator,
            Stage::Resolving,
            FailureReason::DependencyInstall {
                plugin: name.to_string(),
                message: message.into(),
            },
        );
        warn!(plugin = name, reason = %failure.reason, "Dependency installation failed");
        Ok(failure)
    }
}
