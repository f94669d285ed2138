//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust
//! use claude_plugins::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::Result;

// Discovery
pub use crate::orchestrator::{
    CandidateFailure, DiscoveryReport, FailureClass, HotReloadHandle, Orchestrator, ReloadEvent,
    Stage,
};

// Registry
pub use crate::registry::{PluginRegistry, PluginStatus, RegistryEntry, RegistrySnapshot};

// Configuration
pub use crate::config::{EnvOverrides, ResolverConfig};

// Sources
pub use crate::sources::{Candidate, SourceKind, SourceProbe};

// Components
pub use crate::components::{CommandDescriptor, ComponentSet, HookEvent};

// Manifest
pub use crate::manifest::{Permission, PluginManifest};
