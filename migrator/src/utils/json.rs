//! JSON file helpers for manifests and reports

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Read and parse a JSON document
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    tracing::debug!(path = %path.display(), "Reading JSON file");
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write a value as pretty JSON
///
/// The document is written to a sibling temp file and renamed into place, so
/// an interrupted run never leaves a truncated manifest or report behind.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = to_pretty_string(value)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    tracing::debug!(path = %path.display(), "Wrote JSON file");
    Ok(())
}

/// Pretty-print a value with a trailing newline
pub fn to_pretty_string<T: Serialize>(value: &T) -> Result<String> {
    let mut content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    content.push('\n');
    Ok(content)
}
