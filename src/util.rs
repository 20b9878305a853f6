//! Shared utility functions for the conductor crate.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object. Braces inside
/// string literals are skipped.
///
/// Rating providers that wrap an LLM frequently print prose around the
/// rating object, so stdout is never parsed as-is.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write a file atomically: write to a sibling temp file, then rename over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Keep the last `max_chars` characters of a string, on a char boundary.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"score": 8}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"score": 8}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_prose() {
        let text = "Here is my rating:\n{\"score\": 7, \"feedback\": \"ok\"}\nThanks!";
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"score": 7, "feedback": "ok"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"breakdown": {"feasibility": 6}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"breakdown": {"feasibility": 6}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_brace_inside_string() {
        let text = r#"{"score": 8, "feedback": "close the } in step 2"} done"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"score": 8, "feedback": "close the } in step 2"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_escaped_quote_inside_string() {
        let text = r#"{"feedback": "say \"{\" twice"}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"score": 8"#), None);
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_tail_keeps_suffix() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
