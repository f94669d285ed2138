use serde::Serialize;

use crate::components::LoadError;
use crate::manifest::ManifestError;
use crate::registry::RegistryError;
use crate::security::SecurityError;
use crate::sources::{FetchError, SourceKind};

/// Per-candidate pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Idle,
    Scanning,
    Validating,
    Resolving,
    Loading,
    Registered,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Validating => "validating",
            Self::Resolving => "resolving",
            Self::Loading => "loading",
            Self::Registered => "registered",
        };
        f.write_str(name)
    }
}

/// Coarse outcome buckets for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    NotFound,
    Invalid,
    Untrusted,
    MissingDependency,
    NameCollision,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Dependency installation failed for '{plugin}': {message}")]
    DependencyInstall { plugin: String, message: String },

    #[error("Cancelled")]
    Cancelled,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Fetch(FetchError::Integrity { .. } | FetchError::Archive(_)) => {
                FailureClass::Untrusted
            }
            Self::Fetch(FetchError::TooLarge { .. } | FetchError::Unsupported(_)) => {
                FailureClass::Invalid
            }
            Self::Fetch(_) => FailureClass::NotFound,
            Self::Manifest(_) => FailureClass::Invalid,
            Self::Security(SecurityError::Io(_)) => FailureClass::Invalid,
            Self::Security(_) => FailureClass::Untrusted,
            Self::Load(_) => FailureClass::Invalid,
            Self::Registry(RegistryError::NotRegistered(_)) => FailureClass::NotFound,
            Self::Registry(_) => FailureClass::NameCollision,
            Self::DependencyInstall { .. } => FailureClass::MissingDependency,
            Self::Cancelled => FailureClass::Cancelled,
        }
    }
}

/// A dropped candidate, attributed to exactly one stage and reason.
#[derive(Debug, thiserror::Error)]
#[error("{source_kind} {locator} failed at {stage}: {reason}")]
pub struct CandidateFailure {
    pub locator: String,
    pub source_kind: SourceKind,
    pub stage: Stage,
    pub reason: FailureReason,
}

impl CandidateFailure {
    pub fn new(
        source_kind: SourceKind,
        locator: impl Into<String>,
        stage: Stage,
        reason: impl Into<FailureReason>,
    ) -> Self {
        Self {
            locator: locator.into(),
            source_kind,
            stage,
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.reason.class()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.reason, FailureReason::Cancelled)
    }
}
