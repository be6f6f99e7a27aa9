//! Shared utility functions for the Mason crate.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

/// Find the first balanced `{...}` span in model output that parses as JSON.
///
/// Braces inside string literals are ignored, and balanced spans that are not
/// valid JSON (prose like `{placeholder}`) are skipped.
pub fn extract_json_object(text: &str) -> Option<String> {
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let open = from + offset;
        if let Some(len) = balanced_span(&text[open..]) {
            let candidate = &text[open..open + len];
            let parsed = serde_json::from_str::<serde_json::Value>(candidate);
            if parsed.is_ok_and(|v| v.is_object()) {
                return Some(candidate.to_string());
            }
        }
        from = open + 1;
    }
    None
}

/// Byte length of the brace-balanced prefix of `text` (which starts at `{`).
fn balanced_span(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == '{' {
            depth += 1;
        } else if ch == '}' {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(idx + 1);
            }
        }
    }
    None
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let body = serde_json::to_vec_pretty(value).context("Failed to serialize record")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

// Compile regexes once using LazyLock
static NON_BRANCH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9/-]").expect("valid regex"));
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("valid regex"));

const MAX_BRANCH_LEN: usize = 50;

/// Turn free text into a git-safe branch name fragment.
///
/// Lowercases, replaces anything outside `[a-z0-9/-]` with `-`, collapses
/// dash runs, trims leading/trailing dashes, and caps the length at 50.
pub fn sanitize_branch_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = NON_BRANCH_CHARS.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    let mut out: String = collapsed.trim_matches('-').chars().take(MAX_BRANCH_LEN).collect();
    while out.ends_with('-') || out.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain_object() {
        assert_eq!(
            extract_json_object(r#"{"success": true}"#).as_deref(),
            Some(r#"{"success": true}"#)
        );
    }

    #[test]
    fn test_extract_json_surrounded_by_prose() {
        let text = r#"Here are the findings: {"improvements": []} Let me know."#;
        assert_eq!(extract_json_object(text).as_deref(), Some(r#"{"improvements": []}"#));
    }

    #[test]
    fn test_extract_json_keeps_nested_objects() {
        let text = r#"{"report": {"success": false, "spawnRequests": []}}"#;
        assert_eq!(extract_json_object(text).as_deref(), Some(text));
    }

    #[test]
    fn test_extract_json_ignores_braces_in_strings() {
        let text = r#"ok {"solution": "wrap in { braces }", "n": 1} done"#;
        assert_eq!(
            extract_json_object(text).as_deref(),
            Some(r#"{"solution": "wrap in { braces }", "n": 1}"#)
        );
    }

    #[test]
    fn test_extract_json_skips_non_json_braces() {
        let text = r#"Replace {name} with the handler. {"success": true, "summary": "done"}"#;
        assert_eq!(
            extract_json_object(text).as_deref(),
            Some(r#"{"success": true, "summary": "done"}"#)
        );
    }

    #[test]
    fn test_extract_json_none_without_object() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"summary": "cut off"#), None);
    }

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/record.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["v"], 2);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("Add Rate Limiting!"), "add-rate-limiting");
        assert_eq!(sanitize_branch_name("--fix__the  bug--"), "fix-the-bug");
        assert_eq!(sanitize_branch_name("mason/Feature X"), "mason/feature-x");
    }

    #[test]
    fn test_sanitize_branch_name_caps_length() {
        let long = "word ".repeat(30);
        let name = sanitize_branch_name(&long);
        assert!(name.len() <= 50);
        assert!(!name.ends_with('-'));
    }
}
