//! # claude-plugins
//!
//! Discovers, validates and registers Claude plugins from local directories,
//! git repositories, plugin registries and direct manifest URLs.
//!
//! Each candidate runs through the same pipeline: its manifest is parsed and
//! validated, its tree is checksummed and scanned, its dependencies are
//! resolved into an install plan, its commands, agents, skills, hooks and
//! auxiliary servers are loaded, and the result is published to a
//! [`PluginRegistry`] whose readers always see a consistent snapshot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use claude_plugins::{Orchestrator, PluginRegistry, ResolverConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), claude_plugins::Error> {
//!     let config = ResolverConfig::default().with_plugin_dir("./plugins");
//!     let registry = Arc::new(PluginRegistry::new());
//!     let orchestrator = Orchestrator::from_config(config, Arc::clone(&registry)).await?;
//!
//!     let report = orchestrator.discover(CancellationToken::new()).await;
//!     for failure in &report.failures {
//!         eprintln!("{failure}");
//!     }
//!
//!     let snapshot = registry.snapshot().await;
//!     if let Some((plugin, command)) = snapshot.resolve_command("@plugin-a status") {
//!         println!("{} from {}", command.description, plugin.name());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Hot reload
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use claude_plugins::{Orchestrator, PluginRegistry, ReloadEvent, ResolverConfig};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run(orchestrator: Arc<Orchestrator>) -> claude_plugins::Result<()> {
//! let mut reload = orchestrator.spawn_hot_reload(CancellationToken::new()).await?;
//! while let Some(event) = reload.next_event().await {
//!     if let ReloadEvent::Failed { failure, .. } = event {
//!         eprintln!("{failure}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod common;
pub mod components;
pub mod config;
pub mod dependencies;
pub mod manifest;
pub mod orchestrator;
pub mod prelude;
pub mod registry;
pub mod security;
pub mod sources;

pub use cache::{CacheError, DiscoveryCache, DiscoveryCacheRecord};
pub use components::{
    AgentDescriptor, AuxiliaryServer, CommandDescriptor, ComponentCategory, ComponentLoader,
    ComponentSet, HookBinding, HookEvent, LoadError, ParameterSpec, ServerConnection,
    SkillDescriptor,
};
pub use config::{ConfigError, EnvOverrides, RegistryEndpoint, ResolverConfig, RetrySettings};
pub use dependencies::{
    DependencyProbe, DependencyResolver, DependencyStatus, InstallPlan, InstallStep,
};
pub use manifest::{
    DependencyKind, DependencySpec, ManifestError, ManifestParser, Permission, PluginManifest,
    ValidatedManifest, VersionConstraint,
};
pub use orchestrator::{
    CandidateFailure, DiscoveryReport, FailureClass, FailureReason, HotReloadHandle, Orchestrator,
    RegisteredPlugin, ReloadEvent, SkippedCandidate, Stage,
};
pub use registry::{
    PluginOrigin, PluginRegistry, PluginStatus, RegisterOutcome, RegistryEntry, RegistryError,
    RegistrySnapshot,
};
pub use security::{SecurityError, SecurityFinding, SecurityScanner, ValidatedPlugin};
pub use sources::{
    Candidate, ContentStore, DirectUrlProbe, FetchError, FetchedManifest, FilesystemProbe,
    GitProbe, HttpFetcher, RegistryProbe, SourceDiagnostic, SourceKind, SourceProbe,
};

/// Error type for claude-plugins operations.
///
/// Per-candidate failures during discovery are reported through
/// [`DiscoveryReport`] rather than this type; it covers setup and
/// standalone calls.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Discovery cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Candidate(#[from] CandidateFailure),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem watcher could not be set up.
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Failed to parse a component document.
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed manifests, documents or configuration
    Configuration,
    /// Checksum, signature or content scan failures
    Integrity,
    /// Network errors that may succeed on retry
    Transient,
    /// Name or command collisions in the registry
    Conflict,
    /// IO, JSON and watcher errors
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Manifest(_) | Error::Load(_) | Error::Config(_) | Error::Parse(_) => {
                ErrorCategory::Configuration
            }
            Error::Security(SecurityError::Io(_)) => ErrorCategory::Internal,
            Error::Security(_) => ErrorCategory::Integrity,
            Error::Fetch(e) if e.is_retryable() => ErrorCategory::Transient,
            Error::Fetch(FetchError::Integrity { .. } | FetchError::Archive(_)) => {
                ErrorCategory::Integrity
            }
            Error::Fetch(_) => ErrorCategory::Internal,
            Error::Registry(_) => ErrorCategory::Conflict,
            Error::Candidate(failure) => match failure.class() {
                FailureClass::Untrusted => ErrorCategory::Integrity,
                FailureClass::NameCollision => ErrorCategory::Conflict,
                FailureClass::Invalid | FailureClass::MissingDependency => {
                    ErrorCategory::Configuration
                }
                FailureClass::NotFound | FailureClass::Cancelled => ErrorCategory::Internal,
            },
            Error::Cache(_) | Error::Io(_) | Error::Json(_) | Error::Watch(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

pub type Result<T> = std::result::Result<T, Error>;
