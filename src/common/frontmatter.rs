use serde::de::DeserializeOwned;

const DELIMITER: &str = "---";

pub struct ParsedDocument<F> {
    pub frontmatter: F,
    pub body: String,
}

/// Splits `content` into its raw YAML frontmatter and body.
///
/// Returns `None` when the document does not open with a `---` line.
fn split(content: &str) -> Option<crate::Result<(&str, &str)>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let after_first = content.strip_prefix(DELIMITER)?;

    let Some(end_pos) = after_first.find(&format!("\n{DELIMITER}")) else {
        return Some(Err(crate::Error::Parse(
            "Frontmatter not properly terminated with ---".to_string(),
        )));
    };

    let frontmatter = after_first[..end_pos].trim();
    let body = after_first[end_pos + 1 + DELIMITER.len()..].trim();
    Some(Ok((frontmatter, body)))
}

fn deserialize<F: DeserializeOwned>(raw: &str) -> crate::Result<F> {
    serde_yaml_bw::from_str(raw)
        .map_err(|e| crate::Error::Parse(format!("Failed to parse frontmatter: {}", e)))
}

pub fn parse_frontmatter<F: DeserializeOwned>(content: &str) -> crate::Result<ParsedDocument<F>> {
    let (raw, body) = split(content).ok_or_else(|| {
        crate::Error::Parse("Document must have YAML frontmatter (starting with ---)".to_string())
    })??;

    Ok(ParsedDocument {
        frontmatter: deserialize(raw)?,
        body: body.to_string(),
    })
}

/// Like [`parse_frontmatter`], but a document without frontmatter is accepted
/// and yields `None` with the whole content as body.
pub fn parse_optional_frontmatter<F: DeserializeOwned>(
    content: &str,
) -> crate::Result<ParsedDocument<Option<F>>> {
    match split(content) {
        None => Ok(ParsedDocument {
            frontmatter: None,
            body: content.trim().to_string(),
        }),
        Some(parts) => {
            let (raw, body) = parts?;
            let frontmatter = if raw.is_empty() {
                None
            } else {
                Some(deserialize(raw)?)
            };
            Ok(ParsedDocument {
                frontmatter,
                body: body.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestFrontmatter {
        name: String,
        #[serde(default)]
        description: String,
    }

    #[test]
    fn test_parse_valid() {
        let content = r#"---
name: test
description: A test
---

Body content here."#;

        let doc = parse_frontmatter::<TestFrontmatter>(content).unwrap();
        assert_eq!(doc.frontmatter.name, "test");
        assert_eq!(doc.frontmatter.description, "A test");
        assert_eq!(doc.body, "Body content here.");
    }

    #[test]
    fn test_parse_no_frontmatter() {
        let content = "Just content without frontmatter";
        let result = parse_frontmatter::<TestFrontmatter>(content);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_unterminated() {
        let content = "---\nname: test\nNo closing delimiter";
        let result = parse_frontmatter::<TestFrontmatter>(content);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_empty_body() {
        let content = "---\nname: minimal\n---\n";

        let doc = parse_frontmatter::<TestFrontmatter>(content).unwrap();
        assert_eq!(doc.frontmatter.name, "minimal");
        assert!(doc.body.is_empty());
    }

    #[test]
    fn test_dashes_inside_value_do_not_terminate() {
        let content = "---\nname: a---b\n---\nbody";
        let doc = parse_frontmatter::<TestFrontmatter>(content).unwrap();
        assert_eq!(doc.frontmatter.name, "a---b");
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn test_optional_frontmatter_absent() {
        let doc = parse_optional_frontmatter::<TestFrontmatter>("# Status\n\nShow status").unwrap();
        assert!(doc.frontmatter.is_none());
        assert_eq!(doc.body, "# Status\n\nShow status");
    }

    #[test]
    fn test_optional_frontmatter_present() {
        let doc =
            parse_optional_frontmatter::<TestFrontmatter>("---\nname: logs\n---\nTail logs").unwrap();
        assert_eq!(doc.frontmatter.unwrap().name, "logs");
        assert_eq!(doc.body, "Tail logs");
    }
}
