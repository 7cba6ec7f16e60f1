//! Atomic file writing for store, inbox, and registry files.
//!
//! Content is written to a temporary file in the destination directory,
//! flushed to disk, then renamed over the target with
//! `tempfile::NamedTempFile::persist()`. Readers observe either the old
//! or the new file, never a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Summary of a completed file write operation.
#[derive(Debug, Clone)]
pub struct WriteSummary {
    /// Absolute path of the written file.
    pub path: PathBuf,
    /// Number of bytes written.
    pub bytes_written: usize,
}

/// Atomically replace `path` with `content`, creating parent directories.
///
/// # Errors
///
/// Returns `AppError::Io` on directory creation, temp file write, fsync,
/// or rename failure.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<WriteSummary> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", path.display())))?;

    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create parent directories for {}: {err}",
            path.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;

    tmp.write_all(content)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync temporary file: {err}")))?;

    tmp.persist(path).map_err(|err| {
        AppError::Io(format!("failed to persist file to {}: {err}", path.display()))
    })?;

    Ok(WriteSummary {
        path: path.to_owned(),
        bytes_written: content.len(),
    })
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns `AppError::Io` if serialization or the write fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<WriteSummary> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to serialize {}: {err}", path.display())))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}
