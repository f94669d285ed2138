mod directory;
mod frontmatter;

use std::path::PathBuf;

pub(crate) use directory::{component_stem, is_markdown, is_skill_file, sorted_entries};
pub(crate) use frontmatter::{parse_frontmatter, parse_optional_frontmatter};

pub(crate) fn home_dir() -> Option<PathBuf> {
    directories::UserDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Placeholder substituted with a plugin's root directory in hook commands
/// and auxiliary server declarations.
pub const PLUGIN_ROOT_VAR: &str = "${CLAUDE_PLUGIN_ROOT}";

pub(crate) fn resolve_plugin_root(value: &str, root: &std::path::Path) -> String {
    value.replace(PLUGIN_ROOT_VAR, &root.display().to_string())
}
