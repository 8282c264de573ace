//! Durable file writes.
//!
//! Outputs are staged into `*.tmp` siblings and synced before anything is
//! replaced. A multi-file commit keeps `*.bak` copies of the files it replaces
//! until every rename has succeeded, and puts them back if one fails.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to write {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("Failed to rename {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, #[source] std::io::Error),
}

/// Read a file, treating a missing file as `None`
pub fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Read(path.to_path_buf(), e)),
    }
}

/// Replace a single file through a synced temp file
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let temp = sibling(path, ".tmp");
    if let Err(e) = write_synced(&temp, content) {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        StoreError::Rename(temp.clone(), path.to_path_buf(), e)
    })
}

/// Replace several files as one unit.
///
/// Files are put in place in the given order. Either all of them end up with
/// the new content, or all of them keep what they held before.
pub fn commit(files: &[(PathBuf, String)]) -> Result<(), StoreError> {
    let staged: Vec<(PathBuf, PathBuf)> = files
        .iter()
        .map(|(target, _)| (sibling(target, ".tmp"), target.clone()))
        .collect();

    for ((temp, _), (_, content)) in staged.iter().zip(files) {
        if let Err(e) = write_synced(temp, content) {
            remove_temps(&staged);
            return Err(e);
        }
    }

    // Set existing files aside
    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (_, target) in &staged {
        if !target.exists() {
            continue;
        }
        let backup = sibling(target, ".bak");
        if let Err(e) = std::fs::rename(target, &backup) {
            restore(&backups, &[]);
            remove_temps(&staged);
            return Err(StoreError::Rename(target.clone(), backup, e));
        }
        backups.push((backup, target.clone()));
    }

    let mut placed: Vec<PathBuf> = Vec::new();
    for (temp, target) in &staged {
        if let Err(e) = std::fs::rename(temp, target) {
            error!(target = %target.display(), error = %e, "Commit failed, rolling back");
            restore(&backups, &placed);
            remove_temps(&staged);
            return Err(StoreError::Rename(temp.clone(), target.clone(), e));
        }
        placed.push(target.clone());
    }

    for (backup, _) in &backups {
        if let Err(e) = std::fs::remove_file(backup) {
            warn!(backup = %backup.display(), error = %e, "Failed to remove backup");
        }
    }
    debug!(files = files.len(), "Committed");
    Ok(())
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_synced(path: &Path, content: &str) -> Result<(), StoreError> {
    let mut file = File::create(path).map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::Write(path.to_path_buf(), e))
}

/// Undo a partial commit: drop newly placed files, then bring back backups
fn restore(backups: &[(PathBuf, PathBuf)], placed: &[PathBuf]) {
    for target in placed {
        if backups.iter().all(|(_, original)| original != target) {
            let _ = std::fs::remove_file(target);
        }
    }
    for (backup, target) in backups {
        if let Err(e) = std::fs::rename(backup, target) {
            error!(
                backup = %backup.display(),
                target = %target.display(),
                error = %e,
                "Failed to restore backup"
            );
        }
    }
}

fn remove_temps(staged: &[(PathBuf, PathBuf)]) {
    for (temp, _) in staged {
        let _ = std::fs::remove_file(temp);
    }
}
