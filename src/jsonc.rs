//! JSON-with-comments reading and atomic pretty-printed writing
//!
//! Template and working-config files permit `//` and `/* */` comments on
//! input; comments are stripped before parsing and never written back.
//! All writes go through the atomic tmp-fsync-rename path so a crash can
//! never leave a half-written state file behind.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from JSONC reading and writing
#[derive(Debug, Error)]
pub enum JsoncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Strip `//` line comments and `/* */` block comments.
///
/// String literals are respected: comment markers inside quoted strings
/// are left alone.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    // Line comment: skip to end of line, keep the newline
                    for c in chars.by_ref() {
                        if c == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }

    out
}

/// Parse a JSONC string into a typed value
pub fn from_str<T: DeserializeOwned>(content: &str) -> Result<T, JsoncError> {
    Ok(serde_json::from_str(&strip_comments(content))?)
}

/// Read and parse a JSONC file
pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T, JsoncError> {
    let content = std::fs::read_to_string(path)?;
    from_str(&content)
}

/// Write a value as pretty-printed JSON via tmp-fsync-rename
pub fn write_file_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), JsoncError> {
    let content = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, content.as_bytes())?;
    Ok(())
}

/// Atomically replace a file's contents
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_strip_line_comments() {
        let input = r#"{
            // the batch size
            "batchSize": 32
        }"#;

        let value: Value = from_str(input).unwrap();
        assert_eq!(value["batchSize"], 32);
    }

    #[test]
    fn test_strip_block_comments() {
        let input = r#"{ /* inline */ "a": 1, "b": /* mid */ 2 }"#;
        let value: Value = from_str(input).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], 2);
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let input = r#"{ "url": "wss://host/path", "note": "a /* not a comment */" }"#;
        let value: Value = from_str(input).unwrap();
        assert_eq!(value["url"], "wss://host/path");
        assert_eq!(value["note"], "a /* not a comment */");
    }

    #[test]
    fn test_atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let value = serde_json::json!({"generation": 7});
        write_file_atomic(&path, &value).unwrap();

        let back: Value = read_file(&path).unwrap();
        assert_eq!(back, value);

        // No tmp file left behind
        assert!(!path.with_extension("tmp").exists());
    }
}
