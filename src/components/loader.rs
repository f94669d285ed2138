use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{
    AgentDescriptor, CommandDescriptor, ComponentCategory, ComponentSet, LoadError, ParameterSpec,
    SkillDescriptor, hooks, namespace, servers,
};
use crate::common::{
    component_stem, is_markdown, is_skill_file, parse_frontmatter, parse_optional_frontmatter,
    sorted_entries,
};
use crate::manifest::PluginManifest;
use crate::security::ValidatedPlugin;

const COMMANDS_DIR: &str = "commands";
const AGENTS_DIR: &str = "agents";
const SKILLS_DIR: &str = "skills";
const HOOKS_FILE: &str = "hooks/hooks.json";
const SERVERS_FILE: &str = ".mcp.json";
const SKILL_FILE: &str = "SKILL.md";
const HOOKS_DIR: &str = "hooks";
const CATEGORY_PATHS: [&str; 6] = [
    COMMANDS_DIR,
    AGENTS_DIR,
    SKILLS_DIR,
    HOOKS_DIR,
    HOOKS_FILE,
    SERVERS_FILE,
];

#[derive(Debug, Default, Deserialize)]
struct CommandFrontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<Vec<ParameterSpec>>,
    #[serde(default, alias = "argument-hint")]
    argument_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentFrontmatter {
    name: String,
    description: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tools: Option<ToolList>,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    #[serde(default)]
    name: Option<String>,
    description: String,
    #[serde(default, alias = "allowed-tools")]
    allowed_tools: Option<ToolList>,
}

/// `Read, Grep` or `[Read, Grep]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolList {
    Csv(String),
    List(Vec<String>),
}

impl ToolList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Csv(s) => s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            Self::List(list) => list,
        }
    }
}

/// Reads a plugin's component directories into a [`ComponentSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentLoader;

impl ComponentLoader {
    pub fn new() -> Self {
        Self
    }

    pub async fn load(&self, plugin: &ValidatedPlugin) -> Result<ComponentSet, LoadError> {
        self.load_from(&plugin.manifest, &plugin.root_path).await
    }

    /// Loads every category present under `root`. Absent categories are
    /// skipped; a plugin with nothing at all is rejected.
    pub async fn load_from(
        &self,
        manifest: &PluginManifest,
        root: &Path,
    ) -> Result<ComponentSet, LoadError> {
        let plugin = manifest.name.as_str();
        let mut set = ComponentSet::default();

        for category in CATEGORY_PATHS {
            reject_symlink(&root.join(category)).await?;
        }

        self.load_commands(manifest.prefix(), root, &mut set).await?;
        self.load_agents(plugin, root, &mut set).await?;
        self.load_skills(plugin, root, &mut set).await?;
        self.load_hooks(plugin, root, &mut set).await?;
        self.load_servers(plugin, root, &mut set).await?;

        if set.is_empty() {
            return Err(LoadError::EmptyPlugin {
                plugin: plugin.to_string(),
            });
        }

        debug!(
            plugin,
            commands = set.commands.len(),
            agents = set.agents.len(),
            skills = set.skills.len(),
            hooks = set.hooks.len(),
            servers = set.auxiliary_servers.len(),
            "Loaded plugin components"
        );
        Ok(set)
    }

    async fn load_commands(
        &self,
        prefix: &str,
        root: &Path,
        set: &mut ComponentSet,
    ) -> Result<(), LoadError> {
        for path in sorted_entries(&root.join(COMMANDS_DIR)).await? {
            if !is_markdown(&path) {
                continue;
            }
            reject_symlink(&path).await?;
            if !path.is_file() {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let doc = parse_optional_frontmatter::<CommandFrontmatter>(&content)
                .map_err(|e| invalid(&path, e))?;
            let fm = doc.frontmatter.unwrap_or_default();

            let name = match fm.name {
                Some(name) => name,
                None => stem(&path)?,
            };
            validate_command_name(&name, &path)?;

            let description = fm
                .description
                .unwrap_or_else(|| first_line(&doc.body).to_string());
            let parameters = match (fm.parameters, fm.argument_hint) {
                (Some(params), _) => params,
                (None, Some(hint)) => parameters_from_hint(&hint),
                (None, None) => Vec::new(),
            };

            let identifier = namespace::command_identifier(prefix, &name);
            let descriptor = CommandDescriptor {
                name,
                identifier: identifier.clone(),
                description,
                parameters,
                source: path,
            };
            insert_unique(
                &mut set.commands,
                ComponentCategory::Command,
                identifier,
                descriptor,
            )?;
        }
        Ok(())
    }

    async fn load_agents(
        &self,
        plugin: &str,
        root: &Path,
        set: &mut ComponentSet,
    ) -> Result<(), LoadError> {
        for path in sorted_entries(&root.join(AGENTS_DIR)).await? {
            if !is_markdown(&path) {
                continue;
            }
            reject_symlink(&path).await?;
            if !path.is_file() {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let fm = parse_frontmatter::<AgentFrontmatter>(&content)
                .map_err(|e| invalid(&path, e))?
                .frontmatter;

            let name = namespace::namespaced(plugin, &fm.name);
            let descriptor = AgentDescriptor {
                name: name.clone(),
                description: fm.description,
                model: fm.model,
                tools: fm.tools.map(ToolList::into_vec).unwrap_or_default(),
                source: path,
            };
            insert_unique(&mut set.agents, ComponentCategory::Agent, name, descriptor)?;
        }
        Ok(())
    }

    async fn load_skills(
        &self,
        plugin: &str,
        root: &Path,
        set: &mut ComponentSet,
    ) -> Result<(), LoadError> {
        for path in sorted_entries(&root.join(SKILLS_DIR)).await? {
            reject_symlink(&path).await?;
            let (file, fallback) = if path.is_dir() {
                let file = path.join(SKILL_FILE);
                reject_symlink(&file).await?;
                if !file.is_file() {
                    continue;
                }
                let dir_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(String::from);
                (file, dir_name)
            } else if is_skill_file(&path) {
                let stem = component_stem(&path).map(String::from);
                (path, stem)
            } else {
                continue;
            };

            let content = tokio::fs::read_to_string(&file).await?;
            let fm = parse_frontmatter::<SkillFrontmatter>(&content)
                .map_err(|e| invalid(&file, e))?
                .frontmatter;

            let Some(name) = fm.name.or(fallback) else {
                return Err(invalid(&file, "skill has no name"));
            };
            let name = namespace::namespaced(plugin, &name);
            let descriptor = SkillDescriptor {
                name: name.clone(),
                description: fm.description,
                allowed_tools: fm.allowed_tools.map(ToolList::into_vec).unwrap_or_default(),
                source: file,
            };
            insert_unique(&mut set.skills, ComponentCategory::Skill, name, descriptor)?;
        }
        Ok(())
    }

    async fn load_hooks(
        &self,
        plugin: &str,
        root: &Path,
        set: &mut ComponentSet,
    ) -> Result<(), LoadError> {
        let path = root.join(HOOKS_FILE);
        let Some(content) = read_optional(&path).await? else {
            return Ok(());
        };
        set.hooks = hooks::parse_hooks(&content, plugin, root).map_err(|e| invalid(&path, e))?;
        Ok(())
    }

    async fn load_servers(
        &self,
        plugin: &str,
        root: &Path,
        set: &mut ComponentSet,
    ) -> Result<(), LoadError> {
        let path = root.join(SERVERS_FILE);
        let Some(content) = read_optional(&path).await? else {
            return Ok(());
        };
        set.auxiliary_servers =
            servers::parse_servers(&content, plugin, root).map_err(|e| invalid(&path, e))?;
        Ok(())
    }
}

fn invalid(path: &Path, reason: impl ToString) -> LoadError {
    LoadError::InvalidDocument {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Component documents must be regular files inside the plugin tree.
async fn reject_symlink(path: &Path) -> Result<(), LoadError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            Err(invalid(path, "symbolic links are not allowed"))
        }
        _ => Ok(()),
    }
}

fn stem(path: &Path) -> Result<String, LoadError> {
    component_stem(path)
        .map(String::from)
        .ok_or_else(|| invalid(path, "file name is not valid UTF-8"))
}

fn validate_command_name(name: &str, path: &Path) -> Result<(), LoadError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(invalid(path, format!("invalid command name '{name}'")));
    }
    Ok(())
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    category: ComponentCategory,
    key: String,
    value: T,
) -> Result<(), LoadError> {
    match map.entry(key) {
        Entry::Occupied(e) => Err(LoadError::DuplicateComponent {
            category,
            name: e.key().clone(),
        }),
        Entry::Vacant(e) => {
            e.insert(value);
            Ok(())
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, LoadError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn first_line(body: &str) -> &str {
    body.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}

fn hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^>]+)>|\[([^\]]+)\]").expect("valid hint regex"))
}

/// `<service> [lines]` → required `service`, optional `lines`.
fn parameters_from_hint(hint: &str) -> Vec<ParameterSpec> {
    hint_regex()
        .captures_iter(hint)
        .filter_map(|caps| {
            let (m, required) = match (caps.get(1), caps.get(2)) {
                (Some(m), _) => (m, true),
                (None, Some(m)) => (m, false),
                (None, None) => return None,
            };
            Some(ParameterSpec {
                name: m.as_str().trim().to_string(),
                description: String::new(),
                required,
            })
        })
        .collect()
}
