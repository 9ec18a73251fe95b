// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! File operations shared by the download manager and the encryption service
//!
//! # Key Operations
//! - Idempotent deletion (a missing file or directory is success)
//! - Atomic writes (temp file, fsync, rename)
//! - Directory creation and bulk reset
//! - Disk space queries

use crate::error::{OfflineError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Free and total bytes on the volume holding a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

/// File manager rooted at one directory it owns
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    /// Create a new file manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed
    pub async fn ensure_root(&self) -> Result<()> {
        ensure_directory_exists(&self.root).await
    }

    /// Delete the root and everything in it, then recreate it empty
    pub async fn reset_root(&self) -> Result<()> {
        remove_dir_if_exists(&self.root).await?;
        ensure_directory_exists(&self.root).await
    }

    /// Disk space on the volume holding the root
    ///
    /// Queries the nearest existing ancestor so it also works before the
    /// root has been created.
    pub fn disk_space(&self) -> Result<DiskSpace> {
        let probe = self
            .root
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));

        let available = fs2::available_space(probe)
            .map_err(|e| OfflineError::file_io("Failed to query free space of", probe, e))?;
        let total = fs2::total_space(probe)
            .map_err(|e| OfflineError::file_io("Failed to query capacity of", probe, e))?;

        Ok(DiskSpace { available, total })
    }
}

/// Check if file exists
pub async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Get file size in bytes, 0 when the file is missing
pub async fn file_size_or_zero(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Ensure directory exists, creating parent directories as needed
pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| OfflineError::file_io("Failed to create directory", path, e))
}

/// Delete a file; returns whether something was removed
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(OfflineError::file_io("Delete failed:", path, e)),
    }
}

/// Delete a directory tree; a missing directory is success
pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OfflineError::file_io("Failed to remove directory", path, e)),
    }
}

/// Atomic write: write to temp file, then rename
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    write_and_rename(path, contents, None).await
}

/// Atomic write of a file only the owner can read
///
/// On Unix the temp file is created with mode 0600, so the contents are
/// never visible to other users at any point. Elsewhere this is
/// [`atomic_write`].
pub async fn atomic_write_private(path: &Path, contents: &[u8]) -> Result<()> {
    write_and_rename(path, contents, Some(0o600)).await
}

async fn write_and_rename(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let temp_path = match path.parent() {
        Some(parent) => parent.join(format!(".{}.tmp", file_name)),
        None => PathBuf::from(format!(".{}.tmp", file_name)),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory_exists(parent).await?;
        }
    }

    // A leftover temp file would keep its old permissions
    remove_file_if_exists(&temp_path).await?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if let Some(mode) = mode {
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(&temp_path)
        .await
        .map_err(|e| OfflineError::file_io("Failed to create temp file", &temp_path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| OfflineError::file_io("Failed to write temp file", &temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| OfflineError::file_io("Failed to sync temp file", &temp_path, e))?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(OfflineError::FileIoError(format!(
            "Failed to rename temp file {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }

    Ok(())
}
