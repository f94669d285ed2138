use serde::{Deserialize, Serialize};

/// Capability tokens a plugin may request.
///
/// The set is closed: the manifest parser rejects any token not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "file:read")]
    FileRead,
    #[serde(rename = "file:write")]
    FileWrite,
    #[serde(rename = "process:execute")]
    ProcessExecute,
    #[serde(rename = "network:http")]
    NetworkHttp,
    #[serde(rename = "system:env")]
    SystemEnv,
}

impl Permission {
    pub fn all() -> &'static [Permission] {
        &[
            Permission::FileRead,
            Permission::FileWrite,
            Permission::ProcessExecute,
            Permission::NetworkHttp,
            Permission::SystemEnv,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRead => "file:read",
            Self::FileWrite => "file:write",
            Self::ProcessExecute => "process:execute",
            Self::NetworkHttp => "network:http",
            Self::SystemEnv => "system:env",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.as_str() == token)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        for permission in Permission::all() {
            assert_eq!(Permission::from_token(permission.as_str()), Some(*permission));
        }
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(Permission::from_token("delete:everything"), None);
        assert_eq!(Permission::from_token("FILE:READ"), None);
    }

    #[test]
    fn test_serde_matches_tokens() {
        let json = serde_json::to_string(&Permission::NetworkHttp).unwrap();
        assert_eq!(json, "\"network:http\"");
        let parsed: Permission = serde_json::from_str("\"system:env\"").unwrap();
        assert_eq!(parsed, Permission::SystemEnv);
    }
}
