//! Atomic file persistence for credentials, caches, queues, and managed
//! host configuration.
//!
//! Every writer of on-disk agent state goes through this module so that a
//! crash at any point leaves either the old complete file or the new
//! complete file, never a partial write:
//!
//! 1. A temp file is created in the same directory as the target (same
//!    filesystem, so the final rename is atomic).
//! 2. Data is written, flushed, and fsynced to the temp file.
//! 3. The temp file is renamed over the target path.
//! 4. The parent directory is fsynced to commit the rename.
//!
//! Files default to mode 0600 and parent directories to 0700; host drop-in
//! files that must be world-readable (e.g. sshd configuration) use
//! [`atomic_write_mode`] with explicit permissions.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

/// Default mode for agent state files (owner read/write only).
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Default mode for agent state directories (owner only).
pub const SECRET_DIR_MODE: u32 = 0o700;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The target path has no parent directory (cannot create temp file).
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed before any file I/O took place.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically with owner-only permissions.
///
/// # Errors
///
/// Returns [`FsError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    atomic_write_mode(path, data, SECRET_FILE_MODE, SECRET_DIR_MODE)
}

/// Writes `data` to `path` atomically with explicit file and parent
/// directory modes.
///
/// The parent directory is created with `dir_mode` if it does not exist;
/// an existing directory keeps its current permissions.
///
/// # Errors
///
/// Returns [`FsError`] if any filesystem operation fails.
pub fn atomic_write_mode(
    path: &Path,
    data: &[u8],
    file_mode: u32,
    dir_mode: u32,
) -> Result<(), FsError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| FsError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    ensure_dir(parent, dir_mode)?;

    // Temp file in the same directory so the rename below stays on one
    // filesystem and is atomic.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;

    // Data must be durable before the rename makes it visible.
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(file_mode))
            .map_err(|e| FsError::io("set temp file permissions", e))?;
    }
    #[cfg(not(unix))]
    let _ = file_mode;

    tmp.persist(path)
        .map_err(|e| FsError::io("rename temp file into place", e.error))?;

    // fsync the directory so the rename itself survives a crash.
    let dir = File::open(parent).map_err(|e| FsError::io("open parent for fsync", e))?;
    dir.sync_all()
        .map_err(|e| FsError::io("fsync parent directory", e))?;

    Ok(())
}

/// Serializes `value` as pretty-printed JSON and writes it atomically with
/// owner-only permissions.
///
/// Serialization happens in memory before any file I/O, so a serialization
/// failure never leaves a partial file on disk.
///
/// # Errors
///
/// Returns [`FsError::SerializeFailed`] on serialization failure, or any
/// I/O error from [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let json = serde_json::to_vec_pretty(value).map_err(FsError::SerializeFailed)?;
    atomic_write(path, &json)
}

/// Reads a file's contents, mapping a missing file to `None`.
///
/// # Errors
///
/// Returns [`FsError::Io`] for any failure other than the file not
/// existing.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, FsError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::io(format!("read {}", path.display()), e)),
    }
}

/// Removes a file, treating a missing file as success.
///
/// Returns `true` if a file was actually removed.
///
/// # Errors
///
/// Returns [`FsError::Io`] for any failure other than the file not
/// existing.
pub fn remove_if_exists(path: &Path) -> Result<bool, FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io(format!("remove {}", path.display()), e)),
    }
}

/// Ensures a directory exists, creating it (and any missing ancestors)
/// with the given mode.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the directory cannot be created.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<(), FsError> {
    if path.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .map_err(|e| FsError::io(format!("create directory {}", path.display()), e))?;
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::create_dir_all(path)
            .map_err(|e| FsError::io(format!("create directory {}", path.display()), e))?;
    }

    Ok(())
}
