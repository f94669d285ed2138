use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde_json::{Map, Value};

use super::{DependencySpec, ManifestSignature, Permission, PluginAuthor, PluginManifest};

/// Manifests larger than this are rejected before any parsing happens.
pub const MAX_MANIFEST_SIZE: usize = 64 * 1024;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest is not valid JSON: {0}")]
    MalformedSyntax(String),

    #[error("Manifest field '{field}' is invalid: {reason}")]
    SchemaViolation { field: String, reason: String },

    #[error("Unsupported permission token '{token}'")]
    UnsupportedPermission { token: String },

    #[error("Manifest is {size} bytes, limit is {limit}")]
    OversizedManifest { size: usize, limit: usize },
}

impl ManifestError {
    fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A parsed manifest together with the canonical bytes that feed its checksum.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    pub manifest: PluginManifest,
    /// Compact JSON with sorted keys and without the `signature` field.
    pub canonical_bytes: Bytes,
}

/// Parser for `.claude-plugin/plugin.json`. Pure over its input bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestParser;

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<ValidatedManifest, ManifestError> {
        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(ManifestError::OversizedManifest {
                size: bytes.len(),
                limit: MAX_MANIFEST_SIZE,
            });
        }

        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ManifestError::MalformedSyntax(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(ManifestError::schema("$", "manifest must be a JSON object"));
        };

        let name = required_str(&object, "name")?;
        validate_identifier("name", name)?;

        let raw_version = required_str(&object, "version")?;
        let version = semver::Version::parse(raw_version)
            .map_err(|e| ManifestError::schema("version", e.to_string()))?;

        let description = optional_str(&object, "description")?.unwrap_or_default();
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ManifestError::schema(
                "description",
                format!("longer than {MAX_DESCRIPTION_LEN} characters"),
            ));
        }

        let permissions = parse_permissions(object.get("permissions"))?;
        let dependencies = parse_dependencies(object.get("dependencies"))?;

        let component_prefix = optional_str(&object, "componentPrefix")?;
        if let Some(prefix) = component_prefix {
            validate_identifier("componentPrefix", prefix)?;
        }

        let signature = match object.get("signature") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<ManifestSignature>(raw.clone())
                    .map_err(|e| ManifestError::schema("signature", e.to_string()))?,
            ),
        };

        let author = match object.get("author") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(PluginAuthor {
                name: name.clone(),
                email: None,
                url: None,
            }),
            Some(raw) => Some(
                serde_json::from_value::<PluginAuthor>(raw.clone())
                    .map_err(|e| ManifestError::schema("author", e.to_string()))?,
            ),
        };

        let keywords = match object.get("keywords") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value::<Vec<String>>(raw.clone())
                .map_err(|e| ManifestError::schema("keywords", e.to_string()))?,
        };

        let manifest = PluginManifest {
            name: name.to_string(),
            version,
            description: description.to_string(),
            permissions,
            dependencies,
            component_prefix: component_prefix.map(str::to_string),
            signature,
            author,
            homepage: optional_str(&object, "homepage")?.map(str::to_string),
            repository: optional_str(&object, "repository")?.map(str::to_string),
            license: optional_str(&object, "license")?.map(str::to_string),
            keywords,
        };

        let mut unsigned = object;
        unsigned.remove("signature");
        let canonical = canonicalize(Value::Object(unsigned));
        let canonical_bytes = serde_json::to_vec(&canonical)
            .map_err(|e| ManifestError::MalformedSyntax(e.to_string()))?;

        Ok(ValidatedManifest {
            manifest,
            canonical_bytes: Bytes::from(canonical_bytes),
        })
    }
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, ManifestError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ManifestError::schema(field, "must be a string")),
        None => Err(ManifestError::schema(field, "is required")),
    }
}

fn optional_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<Option<&'a str>, ManifestError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ManifestError::schema(field, "must be a string")),
    }
}

/// `^[a-z0-9-]+$`, bounded length.
fn validate_identifier(field: &str, value: &str) -> Result<(), ManifestError> {
    if value.is_empty() {
        return Err(ManifestError::schema(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ManifestError::schema(
            field,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ManifestError::schema(
            field,
            format!("'{value}' must match ^[a-z0-9-]+$"),
        ));
    }
    Ok(())
}

fn parse_permissions(raw: Option<&Value>) -> Result<BTreeSet<Permission>, ManifestError> {
    let items = match raw {
        None | Some(Value::Null) => return Ok(BTreeSet::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ManifestError::schema("permissions", "must be an array")),
    };

    items
        .iter()
        .map(|item| {
            let token = item
                .as_str()
                .ok_or_else(|| ManifestError::schema("permissions", "entries must be strings"))?;
            Permission::from_token(token).ok_or_else(|| ManifestError::UnsupportedPermission {
                token: token.to_string(),
            })
        })
        .collect()
}

fn parse_dependencies(raw: Option<&Value>) -> Result<Vec<DependencySpec>, ManifestError> {
    let entries = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(ManifestError::schema("dependencies", "must be an object")),
    };

    let mut dependencies = Vec::with_capacity(entries.len());
    for (key, constraint) in entries {
        let field = format!("dependencies.{key}");
        let constraint = constraint
            .as_str()
            .ok_or_else(|| ManifestError::schema(&field, "constraint must be a string"))?;
        let spec = DependencySpec::parse(key, constraint)
            .map_err(|reason| ManifestError::schema(&field, reason))?;
        dependencies.push(spec);
    }

    dependencies.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(dependencies)
}

/// Rebuilds every object with sorted keys so the serialized form does not
/// depend on the key order of the source document.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
