//! Outbound directive handling for ChatRelay.
#![allow(dead_code)]
//!
//! Agents request file delivery with `[send_file: path]` markers in their
//! responses. Targets resolve against a fixed sandbox root; anything that
//! escapes it is dropped before a single byte is read.

use regex::Regex;
use std::path::{Component, Path, PathBuf};

use crate::error::Error;

/// Extract and validate `[send_file: ...]` directives from a response.
///
/// Returns the response with directive markers stripped, plus the validated
/// file paths. Invalid targets are dropped with a warning, never surfaced to
/// the chat user.
pub fn extract_send_files(response: &str, files_root: &Path) -> (String, Vec<PathBuf>) {
    let re = match Regex::new(r"\[send_file:\s*([^\]]+)\]") {
        Ok(r) => r,
        Err(_) => return (response.to_string(), Vec::new()),
    };

    let mut files = Vec::new();
    for caps in re.captures_iter(response) {
        let raw = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        match validate_target(files_root, raw) {
            Ok(path) => {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
            Err(e) => {
                tracing::warn!("Dropped send_file directive '{}': {}", raw, e);
            }
        }
    }

    let cleaned = re.replace_all(response, "").trim().to_string();
    (cleaned, files)
}

/// Validate a directive target against the sandbox root.
///
/// Rejected: absolute paths, parent-directory traversal, targets that do not
/// exist, and symlinks resolving outside the root.
pub fn validate_target(root: &Path, raw: &str) -> Result<PathBuf, Error> {
    if raw.is_empty() {
        return Err(Error::Validation("empty file target".to_string()));
    }

    let target = Path::new(raw);
    if target.is_absolute() {
        return Err(Error::Validation(format!(
            "absolute path not allowed: {}",
            raw
        )));
    }

    if target
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Validation(format!(
            "parent traversal not allowed: {}",
            raw
        )));
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::Validation(format!("files root unavailable: {}", e)))?;

    let resolved = canonical_root
        .join(target)
        .canonicalize()
        .map_err(|_| Error::Validation(format!("file not found in sandbox: {}", raw)))?;

    if !resolved.starts_with(&canonical_root) {
        return Err(Error::Validation(format!(
            "target resolves outside the sandbox: {}",
            raw
        )));
    }

    Ok(resolved)
}
