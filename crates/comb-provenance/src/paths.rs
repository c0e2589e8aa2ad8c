//! Path utilities for the ledger layout.

use anyhow::{anyhow, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory holding one JSON file per run.
pub fn runs_dir(ledger_root: &Path) -> PathBuf {
    ledger_root.join("runs")
}

/// Full path of a run's record file.
pub fn run_record_path(ledger_root: &Path, run_id: &str) -> PathBuf {
    runs_dir(ledger_root).join(format!("{}.json", run_id))
}

/// Append-only index of every run.
pub fn ledger_index_path(ledger_root: &Path) -> PathBuf {
    ledger_root.join("ledger.jsonl")
}

/// Ensure all parent directories exist for a path.
pub fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow!("Failed to create directory {}: {}", parent.display(), e))?;
    }
    Ok(())
}

/// Write a file atomically (write to .tmp, then rename).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dirs(path)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|s| s.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, contents)
        .map_err(|e| anyhow!("Failed to write temp file {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        anyhow!(
            "Failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

/// Write a file that must not already exist.
///
/// Fails instead of overwriting, so a record once written stays as written.
pub fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| anyhow!("Refusing to write {}: {}", path.display(), e))?;
    file.write_all(contents)
        .map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
    file.sync_all()
        .map_err(|e| anyhow!("Failed to sync {}: {}", path.display(), e))?;
    Ok(())
}
