//! The process-wide table of registered plugins.
//!
//! Writers are serialized by a mutex and publish a new table by swapping an
//! `Arc`; readers take a [`RegistrySnapshot`] and never observe a partial
//! update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::components::{CommandDescriptor, ComponentSet};
use crate::dependencies::InstallPlan;
use crate::manifest::PluginManifest;
use crate::security::SecurityFinding;
use crate::sources::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginStatus {
    Active,
    QueuedForDependencies,
    Failed,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::QueuedForDependencies => write!(f, "queued-for-dependencies"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Where a registered plugin was discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOrigin {
    pub source_kind: SourceKind,
    pub locator: String,
}

impl PluginOrigin {
    pub fn new(source_kind: SourceKind, locator: impl Into<String>) -> Self {
        Self {
            source_kind,
            locator: locator.into(),
        }
    }

    /// Whether the plugin root is edited in place rather than materialized
    /// from a remote source.
    pub fn is_local(&self) -> bool {
        match self.source_kind {
            SourceKind::Filesystem => true,
            SourceKind::DirectUrl => {
                !(self.locator.starts_with("http://") || self.locator.starts_with("https://"))
            }
            SourceKind::Git | SourceKind::Registry => false,
        }
    }
}

impl std::fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_kind, self.locator)
    }
}

/// One registered plugin. Never mutated after construction; changes are
/// published by registering a new entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub manifest: PluginManifest,
    pub root_path: PathBuf,
    pub checksum: String,
    pub component_set: ComponentSet,
    pub status: PluginStatus,
    pub loaded_at: DateTime<Utc>,
    pub origin: PluginOrigin,
    pub priority: i32,
    pub install_plan: InstallPlan,
    pub security_findings: Vec<SecurityFinding>,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }

    fn with_status(&self, status: PluginStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Replaced { previous_version: semver::Version },
    Unchanged,
}

impl std::fmt::Display for RegisterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Replaced { previous_version } => write!(f, "replaced {previous_version}"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Command '{identifier}' is already registered by '{existing_owner}'")]
    CommandConflict {
        identifier: String,
        existing_owner: String,
    },

    #[error("Plugin '{name}' is already provided by higher priority source {existing_origin}")]
    Shadowed {
        name: String,
        existing_origin: PluginOrigin,
    },

    #[error("Plugin '{0}' is not registered")]
    NotRegistered(String),
}

#[derive(Debug, Clone, Default)]
struct RegistryTable {
    entries: BTreeMap<String, Arc<RegistryEntry>>,
    /// Command identifier → owning plugin name.
    commands: BTreeMap<String, String>,
}

impl RegistryTable {
    fn without(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.entries.remove(name);
        next.commands.retain(|_, owner| owner != name);
        next
    }
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    table: Arc<RegistryTable>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.table.entries.get(name).map(Arc::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.entries.contains_key(name)
    }

    /// Entries ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.table.entries.values().map(Arc::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    /// Plugin holding `identifier`, in any status.
    pub fn command_owner(&self, identifier: &str) -> Option<&str> {
        self.table.commands.get(identifier).map(String::as_str)
    }

    /// Resolves a command identifier to its descriptor. Only active plugins
    /// answer.
    pub fn resolve_command(&self, identifier: &str) -> Option<(&RegistryEntry, &CommandDescriptor)> {
        let owner = self.table.commands.get(identifier)?;
        let entry = self.table.entries.get(owner)?;
        if !entry.is_active() {
            return None;
        }
        let command = entry.component_set.commands.get(identifier)?;
        Some((entry.as_ref(), command))
    }

    pub fn find_by_root(&self, root: &Path) -> Option<&RegistryEntry> {
        self.entries().find(|e| e.root_path == root)
    }

    pub fn find_by_locator(&self, locator: &str) -> Option<&RegistryEntry> {
        self.entries().find(|e| e.origin.locator == locator)
    }
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    writer: Mutex<()>,
    table: RwLock<Arc<RegistryTable>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            table: Arc::clone(&*self.table.read().await),
        }
    }

    async fn publish(&self, table: RegistryTable) {
        *self.table.write().await = Arc::new(table);
    }

    /// Inserts or replaces the entry named by its manifest.
    ///
    /// Fails without touching the table when a command identifier belongs to
    /// another plugin, or when the name is already held by a different origin
    /// with higher priority.
    pub async fn register(&self, entry: RegistryEntry) -> Result<RegisterOutcome, RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await.table;
        let name = entry.name().to_string();

        let previous = current.entries.get(&name);
        if let Some(existing) = previous {
            if existing.origin != entry.origin && entry.priority < existing.priority {
                return Err(RegistryError::Shadowed {
                    name,
                    existing_origin: existing.origin.clone(),
                });
            }
            if existing.checksum == entry.checksum
                && existing.status == entry.status
                && existing.install_plan == entry.install_plan
            {
                debug!(plugin = %name, "Registry entry unchanged");
                return Ok(RegisterOutcome::Unchanged);
            }
        }

        for identifier in entry.component_set.command_identifiers() {
            if let Some(owner) = current.commands.get(identifier)
                && owner != &name
            {
                return Err(RegistryError::CommandConflict {
                    identifier: identifier.to_string(),
                    existing_owner: owner.clone(),
                });
            }
        }

        let outcome = match previous {
            Some(existing) => RegisterOutcome::Replaced {
                previous_version: existing.manifest.version.clone(),
            },
            None => RegisterOutcome::Inserted,
        };

        let mut next = current.without(&name);
        for identifier in entry.component_set.command_identifiers() {
            next.commands.insert(identifier.to_string(), name.clone());
        }
        info!(
            plugin = %name,
            version = %entry.manifest.version,
            status = %entry.status,
            origin = %entry.origin,
            %outcome,
            "Registered plugin"
        );
        next.entries.insert(name, Arc::new(entry));
        self.publish(next).await;

        Ok(outcome)
    }

    /// Removes `name` and its commands. Returns whether anything was removed.
    pub async fn unregister(&self, name: &str) -> bool {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await.table;
        if !current.entries.contains_key(name) {
            return false;
        }

        self.publish(current.without(name)).await;
        info!(plugin = name, "Unregistered plugin");
        true
    }

    pub async fn set_status(&self, name: &str, status: PluginStatus) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await.table;
        let Some(existing) = current.entries.get(name) else {
            return Err(RegistryError::NotRegistered(name.to_string()));
        };
        if existing.status == status {
            return Ok(());
        }

        let mut next = (*current).clone();
        next.entries
            .insert(name.to_string(), Arc::new(existing.with_status(status)));
        self.publish(next).await;
        info!(plugin = name, %status, "Plugin status changed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::components::ComponentLoader;
    use crate::manifest::ManifestParser;
    use tempfile::tempdir;

    /// Entry for `name`/`version` whose commands are `commands` under `prefix`.
    pub(crate) async fn entry(
        name: &str,
        version: &str,
        prefix: &str,
        commands: &[&str],
    ) -> RegistryEntry {
        let dir = tempdir().unwrap();
        for command in commands {
            let path = dir.path().join("commands").join(format!("{command}.md"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("Run {command}")).unwrap();
        }
        let manifest = ManifestParser::new()
            .parse(
                format!(
                    r#"{{"name":"{name}","version":"{version}","componentPrefix":"{prefix}"}}"#
                )
                .as_bytes(),
            )
            .unwrap()
            .manifest;
        let component_set = ComponentLoader::new()
            .load_from(&manifest, dir.path())
            .await
            .unwrap();

        RegistryEntry {
            manifest,
            root_path: PathBuf::from(format!("/plugins/{name}")),
            checksum: format!("{name}-{version}-{}", commands.join(",")),
            component_set,
            status: PluginStatus::Active,
            loaded_at: Utc::now(),
            origin: PluginOrigin::new(SourceKind::Filesystem, format!("/plugins/{name}")),
            priority: 0,
            install_plan: InstallPlan::default(),
            security_findings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = PluginRegistry::new();
        let outcome = registry
            .register(entry("plugin-a", "1.0.0", "plugin-a", &["status"]).await)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Inserted);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let (owner, command) = snapshot.resolve_command("@plugin-a status").unwrap();
        assert_eq!(owner.name(), "plugin-a");
        assert_eq!(command.name, "status");
    }

    #[tokio::test]
    async fn test_namespacing_allows_same_command_name() {
        let registry = PluginRegistry::new();
        registry
            .register(entry("plugin-a", "1.0.0", "a", &["status"]).await)
            .await
            .unwrap();
        registry
            .register(entry("plugin-b", "1.0.0", "b", &["status"]).await)
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.command_owner("@a status"), Some("plugin-a"));
        assert_eq!(snapshot.command_owner("@b status"), Some("plugin-b"));
    }

    #[tokio::test]
    async fn test_conflict_leaves_previous_version_intact() {
        let registry = PluginRegistry::new();
        registry
            .register(entry("plugin-a", "1.0.0", "shared", &["status", "logs"]).await)
            .await
            .unwrap();
        registry
            .register(entry("plugin-b", "1.0.0", "other", &["deploy"]).await)
            .await
            .unwrap();
        let before = registry.snapshot().await;

        // v2 of plugin-b claims a command owned by plugin-a
        let err = registry
            .register(entry("plugin-b", "2.0.0", "shared", &["deploy", "status"]).await)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::CommandConflict {
                identifier: "@shared status".into(),
                existing_owner: "plugin-a".into(),
            }
        );

        let after = registry.snapshot().await;
        assert_eq!(after.get("plugin-b").unwrap().manifest.version.to_string(), "1.0.0");
        assert_eq!(after.command_owner("@other deploy"), Some("plugin-b"));
        assert_eq!(after.command_owner("@shared deploy"), None);
        assert_eq!(
            before.names().collect::<Vec<_>>(),
            after.names().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_replace_swaps_all_commands() {
        let registry = PluginRegistry::new();
        registry
            .register(entry("plugin-a", "1.0.0", "a", &["old", "status"]).await)
            .await
            .unwrap();
        let outcome = registry
            .register(entry("plugin-a", "1.1.0", "a", &["new", "status"]).await)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RegisterOutcome::Replaced {
                previous_version: semver::Version::new(1, 0, 0)
            }
        );

        let snapshot = registry.snapshot().await;
        assert!(snapshot.command_owner("@a old").is_none());
        assert_eq!(snapshot.command_owner("@a new"), Some("plugin-a"));
    }

    #[tokio::test]
    async fn test_unchanged() {
        let registry = PluginRegistry::new();
        let e = entry("plugin-a", "1.0.0", "a", &["status"]).await;
        registry.register(e.clone()).await.unwrap();
        assert_eq!(
            registry.register(e).await.unwrap(),
            RegisterOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_writes() {
        let registry = PluginRegistry::new();
        registry
            .register(entry("plugin-a", "1.0.0", "a", &["status"]).await)
            .await
            .unwrap();
        let snapshot = registry.snapshot().await;

        registry.unregister("plugin-a").await;
        assert!(snapshot.contains("plugin-a"));
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = PluginRegistry::new();
        assert!(!registry.unregister("ghost").await);

        registry
            .register(entry("plugin-a", "1.0.0", "a", &["status"]).await)
            .await
            .unwrap();
        assert!(registry.unregister("plugin-a").await);
        assert!(!registry.unregister("plugin-a").await);
        assert!(registry.snapshot().await.command_owner("@a status").is_none());
    }

    #[tokio::test]
    async fn test_inactive_commands_reserved_but_unresolvable() {
        let registry = PluginRegistry::new();
        let mut queued = entry("plugin-a", "1.0.0", "a", &["status"]).await;
        queued.status = PluginStatus::QueuedForDependencies;
        registry.register(queued).await.unwrap();

        let snapshot = registry.snapshot().await;
        assert!(snapshot.resolve_command("@a status").is_none());
        assert_eq!(snapshot.command_owner("@a status"), Some("plugin-a"));

        let err = registry
            .register(entry("plugin-b", "1.0.0", "a", &["status"]).await)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CommandConflict { .. }));
    }

    #[tokio::test]
    async fn test_priority_shadowing() {
        let registry = PluginRegistry::new();
        let mut local = entry("plugin-a", "1.0.0", "a", &["status"]).await;
        local.priority = 10;
        registry.register(local).await.unwrap();

        let mut remote = entry("plugin-a", "2.0.0", "a", &["status"]).await;
        remote.origin = PluginOrigin::new(SourceKind::Registry, "https://r/plugin-a.tar.gz");
        let err = registry.register(remote.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Shadowed { .. }));

        remote.priority = 10;
        assert!(matches!(
            registry.register(remote).await.unwrap(),
            RegisterOutcome::Replaced { .. }
        ));
    }

    #[tokio::test]
    async fn test_set_status() {
        let registry = PluginRegistry::new();
        registry
            .register(entry("plugin-a", "1.0.0", "a", &["status"]).await)
            .await
            .unwrap();

        registry
            .set_status("plugin-a", PluginStatus::Failed)
            .await
            .unwrap();
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.get("plugin-a").unwrap().status, PluginStatus::Failed);
        assert!(snapshot.resolve_command("@a status").is_none());

        assert_eq!(
            registry.set_status("ghost", PluginStatus::Active).await,
            Err(RegistryError::NotRegistered("ghost".into()))
        );
    }

    #[test]
    fn test_origin_is_local() {
        assert!(PluginOrigin::new(SourceKind::Filesystem, "/p").is_local());
        assert!(PluginOrigin::new(SourceKind::DirectUrl, "file:///p").is_local());
        assert!(!PluginOrigin::new(SourceKind::DirectUrl, "https://x/plugin.json").is_local());
        assert!(!PluginOrigin::new(SourceKind::Git, "github:o/r").is_local());
    }
}
