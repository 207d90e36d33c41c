use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!("{file_name}.tmp"))
}

/// Writes `value` next to `path` and renames it into place, so readers see
/// either the old or the new document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, label: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {} dir {}", label, parent.display()))?;
    }
    let payload =
        serde_json::to_string_pretty(value).with_context(|| format!("failed encoding {}", label))?;
    write_bytes_atomic(path, payload.as_bytes(), label)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8], label: &str) -> Result<()> {
    let tmp = atomic_tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("failed writing {} {}", label, tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed replacing {} {} -> {}",
            label,
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn read_json_if_exists<T: DeserializeOwned>(path: &Path, label: &str) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {} {}", label, path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding {} {}", label, path.display()))?;
    Ok(Some(value))
}
