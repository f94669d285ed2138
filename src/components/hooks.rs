//! `hooks/hooks.json` parsing.
//!
//! Two layouts are accepted:
//!
//! ```json
//! {"hooks": {"PreToolUse": [{"matcher": "Bash", "hooks": [{"type": "command", "command": "..."}]}]}}
//! {"PreToolUse": ["echo pre", {"command": "...", "timeout_secs": 5, "matcher": "Bash"}]}
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::resolve_plugin_root;

/// Lifecycle events a hook can bind to, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PermissionRequest,
    PostToolUse,
    PostToolUseFailure,
    Notification,
    SubagentStart,
    SubagentStop,
    PreCompact,
    Stop,
    SessionEnd,
}

impl HookEvent {
    pub fn all() -> &'static [HookEvent] {
        &[
            Self::SessionStart,
            Self::UserPromptSubmit,
            Self::PreToolUse,
            Self::PermissionRequest,
            Self::PostToolUse,
            Self::PostToolUseFailure,
            Self::Notification,
            Self::SubagentStart,
            Self::SubagentStop,
            Self::PreCompact,
            Self::Stop,
            Self::SessionEnd,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PreToolUse => "PreToolUse",
            Self::PermissionRequest => "PermissionRequest",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::Notification => "Notification",
            Self::SubagentStart => "SubagentStart",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::Stop => "Stop",
            Self::SessionEnd => "SessionEnd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|e| e.as_str() == name)
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command bound to a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookBinding {
    pub plugin: String,
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    /// `${CLAUDE_PLUGIN_ROOT}` already substituted.
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HookRule {
    #[serde(default)]
    matcher: Option<String>,
    hooks: Vec<HookAction>,
}

#[derive(Debug, Deserialize)]
struct HookAction {
    #[serde(rename = "type")]
    hook_type: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlatHook {
    Command(String),
    Full {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        matcher: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HooksFile {
    Official { hooks: HashMap<String, Vec<HookRule>> },
    Flat(HashMap<String, Vec<FlatHook>>),
}

/// Parses a hooks file into bindings ordered by event, then declaration order.
pub fn parse_hooks(content: &str, plugin: &str, root: &Path) -> Result<Vec<HookBinding>, String> {
    let file: HooksFile = serde_json::from_str(content).map_err(|e| e.to_string())?;

    let mut bindings = Vec::new();
    let mut push = |event_name: &str, matcher: Option<String>, command: &str, timeout_secs| {
        let Some(event) = HookEvent::from_name(event_name) else {
            warn!(plugin, event = event_name, "Ignoring unknown hook event");
            return;
        };
        bindings.push(HookBinding {
            plugin: plugin.to_string(),
            event,
            matcher,
            command: resolve_plugin_root(command, root),
            timeout_secs,
        });
    };

    match file {
        HooksFile::Official { hooks } => {
            for (event_name, rules) in &hooks {
                for rule in rules {
                    for action in &rule.hooks {
                        if action.hook_type != "command" {
                            continue;
                        }
                        if let Some(command) = &action.command {
                            push(event_name, rule.matcher.clone(), command, action.timeout);
                        }
                    }
                }
            }
        }
        HooksFile::Flat(events) => {
            for (event_name, hooks) in &events {
                for hook in hooks {
                    match hook {
                        FlatHook::Command(command) => push(event_name, None, command, None),
                        FlatHook::Full {
                            command,
                            timeout_secs,
                            matcher,
                        } => push(event_name, matcher.clone(), command, *timeout_secs),
                    }
                }
            }
        }
    }

    // stable: keeps declaration order within an event
    bindings.sort_by_key(|b| b.event);
    Ok(bindings)
}
