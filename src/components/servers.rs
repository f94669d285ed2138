use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::namespace;
use crate::common::resolve_plugin_root;

/// How the host connects to an auxiliary server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConnection {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// An external process or service declared in `.mcp.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuxiliaryServer {
    /// `plugin:server`
    pub name: String,
    pub connection: ServerConnection,
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(rename = "type", default)]
    transport: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl RawServer {
    fn into_connection(self, root: &Path) -> Result<ServerConnection, String> {
        let resolve = |v: &str| resolve_plugin_root(v, root);

        match self.transport.as_deref() {
            None | Some("stdio") => {
                let command = self.command.ok_or("stdio server requires 'command'")?;
                Ok(ServerConnection::Stdio {
                    command: resolve(&command),
                    args: self.args.iter().map(|a| resolve(a)).collect(),
                    env: self
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), resolve(v)))
                        .collect(),
                    cwd: self.cwd.as_deref().map(resolve),
                })
            }
            Some("sse") => Ok(ServerConnection::Sse {
                url: self.url.ok_or("sse server requires 'url'")?,
                headers: self.headers,
            }),
            Some("http") | Some("streamable-http") => Ok(ServerConnection::Http {
                url: self.url.ok_or("http server requires 'url'")?,
                headers: self.headers,
            }),
            Some(other) => Err(format!("unsupported server type '{other}'")),
        }
    }
}

/// Parses `.mcp.json` into servers keyed by namespaced name.
pub fn parse_servers(
    content: &str,
    plugin: &str,
    root: &Path,
) -> Result<BTreeMap<String, AuxiliaryServer>, String> {
    let file: ServersFile = serde_json::from_str(content).map_err(|e| e.to_string())?;

    let mut servers = BTreeMap::new();
    for (name, raw) in file.mcp_servers {
        let connection = raw
            .into_connection(root)
            .map_err(|e| format!("server '{name}': {e}"))?;
        let name = namespace::namespaced(plugin, &name);
        servers.insert(name.clone(), AuxiliaryServer { name, connection });
    }
    Ok(servers)
}
