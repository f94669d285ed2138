use std::sync::OnceLock;

use regex::Regex;

/// File extensions considered text-like enough to scan.
pub const SCANNED_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "py", "js", "mjs", "cjs", "ts", "rb", "pl", "ps1", "md", "json", "yaml",
    "yml", "toml",
];

/// Files above this size are skipped.
pub const MAX_SCANNED_FILE_SIZE: u64 = 1024 * 1024;

pub struct RiskPattern {
    pub id: &'static str,
    pub regex: Regex,
}

const PATTERN_SOURCES: &[(&str, &str)] = &[
    ("eval-call", r"\beval\s*\("),
    ("function-constructor", r"new\s+Function\s*\("),
    ("shell-eval-interpolation", r#"eval\s+["']?\$"#),
    ("shell-c-interpolation", r#"\b(?:ba)?sh\s+-c\s+["'][^"']*\$"#),
    ("python-shell-true", r"subprocess\.\w+\(.*shell\s*=\s*True"),
    ("os-system", r"\bos\.system\s*\("),
    (
        "child-process-exec",
        r"child_process.*\bexec(?:Sync)?\s*\(|\bexecSync\s*\(",
    ),
    ("pipe-to-shell", r"(?:curl|wget)[^|\n]*\|\s*(?:ba)?sh\b"),
];

pub fn risk_patterns() -> &'static [RiskPattern] {
    static PATTERNS: OnceLock<Vec<RiskPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PATTERN_SOURCES
            .iter()
            .map(|(id, source)| RiskPattern {
                id,
                regex: Regex::new(source).expect("valid risk pattern regex"),
            })
            .collect()
    })
}

pub fn is_scanned_extension(extension: &str) -> bool {
    SCANNED_EXTENSIONS
        .iter()
        .any(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Ids of every pattern matching `line`, in pattern table order.
pub fn match_line(line: &str) -> impl Iterator<Item = &'static str> + '_ {
    risk_patterns()
        .iter()
        .filter(move |p| p.regex.is_match(line))
        .map(|p| p.id)
}
