use std::path::{Path, PathBuf};

/// Lists the entries of `dir` sorted by file name.
///
/// A missing directory yields an empty list so callers can treat optional
/// component directories uniformly.
pub async fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }

    paths.sort();
    Ok(paths)
}

pub fn is_markdown(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "md")
}

pub fn is_skill_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case("SKILL.md") || name.ends_with(".skill.md"))
}

/// File stem with a trailing `.skill` removed (`commit.skill.md` → `commit`).
pub fn component_stem(path: &Path) -> Option<&str> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.strip_suffix(".skill").unwrap_or(stem))
}
