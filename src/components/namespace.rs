//! Naming of plugin-contributed components.
//!
//! Agents, skills and auxiliary servers are namespaced `plugin:name`.
//! Commands are exposed as `@prefix name`.

pub const NAMESPACE_SEP: char = ':';
pub const COMMAND_SIGIL: char = '@';

pub fn namespaced(plugin: &str, resource: &str) -> String {
    format!("{plugin}{NAMESPACE_SEP}{resource}")
}

pub fn parse(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEP)
}

pub fn plugin_name(name: &str) -> Option<&str> {
    parse(name).map(|(p, _)| p)
}

/// Externally visible identifier of a command.
pub fn command_identifier(prefix: &str, command: &str) -> String {
    format!("{COMMAND_SIGIL}{prefix} {command}")
}

/// `@prefix name` → (`prefix`, `name`).
pub fn parse_command_identifier(identifier: &str) -> Option<(&str, &str)> {
    let rest = identifier.strip_prefix(COMMAND_SIGIL)?;
    let (prefix, command) = rest.split_once(' ')?;
    (!prefix.is_empty() && !command.is_empty()).then_some((prefix, command))
}
