use semver::{Version, VersionReq};
use serde::{Serialize, Serializer};

/// Kind of a declared dependency.
///
/// The declaration order of the variants is the installation order:
/// language-runtime packages may need system tools to be present first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    System,
    Npm,
    Python,
}

impl DependencyKind {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "system" => Some(Self::System),
            "npm" => Some(Self::Npm),
            "pip" | "python" => Some(Self::Python),
            _ => None,
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Npm => write!(f, "npm"),
            Self::Python => write!(f, "python"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    Any,
    Req(VersionReq),
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" || raw.eq_ignore_ascii_case("latest") {
            return Ok(Self::Any);
        }
        // pip spellings: `==1.2`, and `~=1.2` (same major) / `~=1.2.3` (same minor)
        let normalized = if let Some(rest) = raw.strip_prefix("==") {
            format!("={rest}")
        } else if let Some(rest) = raw.strip_prefix("~=") {
            if rest.split('.').count() <= 2 {
                format!("^{rest}")
            } else {
                format!("~{rest}")
            }
        } else {
            raw.to_string()
        };
        VersionReq::parse(&normalized)
            .map(Self::Req)
            .map_err(|e| format!("invalid version constraint '{raw}': {e}"))
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Req(req) => req.matches(version),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Req(req) => write!(f, "{req}"),
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySpec {
    pub kind: DependencyKind,
    pub name: String,
    pub constraint: VersionConstraint,
}

impl DependencySpec {
    pub fn new(kind: DependencyKind, name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            kind,
            name: name.into(),
            constraint,
        }
    }

    /// Parses a manifest `dependencies` entry.
    ///
    /// The key may carry a kind prefix (`npm:typescript`, `pip:requests`);
    /// unprefixed keys are system commands. Scoped npm names keep their `@`.
    pub fn parse(key: &str, constraint: &str) -> Result<Self, String> {
        let (kind, name) = match key.split_once(':') {
            Some((prefix, name)) => {
                let kind = DependencyKind::from_prefix(prefix)
                    .ok_or_else(|| format!("unknown dependency kind '{prefix}'"))?;
                (kind, name)
            }
            None => (DependencyKind::System, key),
        };

        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(format!("invalid dependency name '{key}'"));
        }
        if kind != DependencyKind::Npm && name.contains('/') {
            return Err(format!("dependency name '{key}' must not contain '/'"));
        }

        Ok(Self::new(kind, name, VersionConstraint::parse(constraint)?))
    }

    /// Total installation order: kind first, then name.
    pub fn sort_key(&self) -> (DependencyKind, &str) {
        (self.kind, self.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        let dep = DependencySpec::parse("jq", "*").unwrap();
        assert_eq!(dep.kind, DependencyKind::System);
        assert_eq!(dep.name, "jq");
        assert!(dep.constraint.is_any());

        let dep = DependencySpec::parse("npm:@types/node", "^20").unwrap();
        assert_eq!(dep.kind, DependencyKind::Npm);
        assert_eq!(dep.name, "@types/node");

        let dep = DependencySpec::parse("pip:requests", ">=2.0").unwrap();
        assert_eq!(dep.kind, DependencyKind::Python);

        let dep = DependencySpec::parse("system:git", ">=2.30.0").unwrap();
        assert_eq!(dep.kind, DependencyKind::System);
        assert_eq!(dep.name, "git");
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(DependencySpec::parse("cargo:ripgrep", "*").is_err());
        assert!(DependencySpec::parse("", "*").is_err());
        assert!(DependencySpec::parse("my tool", "*").is_err());
        assert!(DependencySpec::parse("bin/tool", "*").is_err());
        assert!(DependencySpec::parse("jq", "not a version").is_err());
    }

    #[test]
    fn test_constraint_pip_spellings() {
        let exact = VersionConstraint::parse("==2.31.0").unwrap();
        assert!(exact.matches(&Version::new(2, 31, 0)));
        assert!(!exact.matches(&Version::new(2, 31, 1)));

        let compatible = VersionConstraint::parse("~=1.4").unwrap();
        assert!(compatible.matches(&Version::new(1, 9, 0)));
        assert!(!compatible.matches(&Version::new(2, 0, 0)));

        let patch_level = VersionConstraint::parse("~=1.4.2").unwrap();
        assert!(patch_level.matches(&Version::new(1, 4, 9)));
        assert!(!patch_level.matches(&Version::new(1, 5, 0)));
    }

    #[test]
    fn test_kind_order() {
        assert!(DependencyKind::System < DependencyKind::Npm);
        assert!(DependencyKind::Npm < DependencyKind::Python);
    }

    #[test]
    fn test_constraint_display() {
        assert_eq!(VersionConstraint::Any.to_string(), "*");
        assert_eq!(VersionConstraint::parse(">=1.2.0").unwrap().to_string(), ">=1.2.0");
    }
}
