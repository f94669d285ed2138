//! Typed records for everything a plugin contributes.

mod hooks;
mod loader;
pub mod namespace;
mod servers;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use hooks::{HookBinding, HookEvent, parse_hooks};
pub use loader::ComponentLoader;
pub use servers::{AuxiliaryServer, ServerConnection, parse_servers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentCategory {
    Command,
    Agent,
    Skill,
    Hook,
    AuxiliaryServer,
}

impl ComponentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Agent => "agent",
            Self::Skill => "skill",
            Self::Hook => "hook",
            Self::AuxiliaryServer => "auxiliary-server",
        }
    }
}

impl std::fmt::Display for ComponentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub name: String,
    /// `@prefix name`
    pub identifier: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    /// `plugin:name`
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillDescriptor {
    /// `plugin:name`
    pub name: String,
    pub description: String,
    pub allowed_tools: Vec<String>,
    pub source: PathBuf,
}

/// Everything one plugin contributes. Map keys are the externally visible
/// names, so iteration order is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentSet {
    /// Keyed by identifier.
    pub commands: BTreeMap<String, CommandDescriptor>,
    pub agents: BTreeMap<String, AgentDescriptor>,
    pub skills: BTreeMap<String, SkillDescriptor>,
    pub hooks: Vec<HookBinding>,
    pub auxiliary_servers: BTreeMap<String, AuxiliaryServer>,
}

impl ComponentSet {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.agents.is_empty()
            && self.skills.is_empty()
            && self.hooks.is_empty()
            && self.auxiliary_servers.is_empty()
    }

    pub fn command_identifiers(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn count(&self, category: ComponentCategory) -> usize {
        match category {
            ComponentCategory::Command => self.commands.len(),
            ComponentCategory::Agent => self.agents.len(),
            ComponentCategory::Skill => self.skills.len(),
            ComponentCategory::Hook => self.hooks.len(),
            ComponentCategory::AuxiliaryServer => self.auxiliary_servers.len(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Plugin '{plugin}' contributes no components")]
    EmptyPlugin { plugin: String },

    #[error("Duplicate {category} '{name}'")]
    DuplicateComponent {
        category: ComponentCategory,
        name: String,
    },

    #[error("Invalid document {path}: {reason}")]
    InvalidDocument { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
