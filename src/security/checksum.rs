//! Deterministic content fingerprint of a plugin.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Paths under a plugin root whose contents are part of the fingerprint.
pub const COMPONENT_PATHS: &[&str] = &[
    "commands",
    "agents",
    "skills",
    "hooks",
    ".mcp.json",
    "package.json",
    "requirements.txt",
];

/// Directory names never descended into.
pub const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist"];

/// blake3 over the canonical manifest bytes followed by every component file,
/// ordered by relative path. Each record is length-prefixed so that path and
/// content boundaries cannot be confused.
pub fn compute_checksum(canonical_manifest: &[u8], root: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(canonical_manifest.len() as u64).to_le_bytes());
    hasher.update(canonical_manifest);

    hash_files(&mut hasher, component_files(root)?);
    Ok(hasher.finalize().to_hex().to_string())
}

/// blake3 over every file under `root` (ignored directories excluded).
/// Used to tell real edits apart from no-op filesystem events.
pub fn tree_hash(root: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_tree(root, root, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = blake3::Hasher::new();
    hash_files(&mut hasher, files);
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_files(hasher: &mut blake3::Hasher, files: Vec<(String, PathBuf)>) {
    for (relative, path) in files {
        match std::fs::read(&path) {
            Ok(content) => {
                hasher.update(&(relative.len() as u64).to_le_bytes());
                hasher.update(relative.as_bytes());
                hasher.update(&(content.len() as u64).to_le_bytes());
                hasher.update(&content);
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable file in checksum");
            }
        }
    }
}

/// Component files as `(relative path with '/' separators, absolute path)`,
/// sorted by relative path.
pub fn component_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();

    for component in COMPONENT_PATHS {
        let path = root.join(component);
        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };

        if metadata.is_file() {
            files.push((component.to_string(), path));
        } else if metadata.is_dir() {
            collect_tree(root, &path, &mut files)?;
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Walks `dir` without following symlinks, skipping [`IGNORED_DIRS`].
pub(crate) fn collect_tree(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(String, PathBuf)>,
) -> std::io::Result<()> {
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry.path()));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(relative) = relative_path(root, entry.path()) {
            files.push((relative, entry.into_path()));
        }
    }

    Ok(())
}

fn is_ignored(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| IGNORED_DIRS.contains(&n))
}

pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}
