//! Plugin manifest model and parser.
//!
//! Every plugin root carries `.claude-plugin/plugin.json`:
//!
//! ```json
//! {
//!   "name": "devops-assistant",
//!   "version": "1.0.0",
//!   "description": "DevOps helpers",
//!   "permissions": ["file:read", "process:execute"],
//!   "dependencies": {"docker": "*", "npm:zx": "^7", "pip:pyyaml": ">=6"},
//!   "componentPrefix": "devops"
//! }
//! ```

mod dependency;
mod parser;
mod permission;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use dependency::{DependencyKind, DependencySpec, VersionConstraint};
pub use parser::{
    MAX_DESCRIPTION_LEN, MAX_MANIFEST_SIZE, MAX_NAME_LEN, ManifestError, ManifestParser,
    ValidatedManifest,
};
pub use permission::Permission;

pub const PLUGIN_CONFIG_DIR: &str = ".claude-plugin";
pub const PLUGIN_MANIFEST_FILE: &str = "plugin.json";

/// Location of the manifest relative to a plugin root.
pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(PLUGIN_CONFIG_DIR).join(PLUGIN_MANIFEST_FILE)
}

pub fn is_plugin_root(dir: &Path) -> bool {
    manifest_path(dir).is_file()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Detached signature over a plugin's checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSignature {
    pub algorithm: String,
    /// Base64 encoded public key.
    pub public_key: String,
    /// Base64 encoded signature bytes.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: semver::Version,
    pub description: String,
    pub permissions: BTreeSet<Permission>,
    /// Sorted by installation order.
    pub dependencies: Vec<DependencySpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<PluginAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl PluginManifest {
    /// Namespace applied to command names; defaults to the plugin name.
    pub fn prefix(&self) -> &str {
        self.component_prefix.as_deref().unwrap_or(&self.name)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
