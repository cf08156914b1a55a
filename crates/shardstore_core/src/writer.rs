//! The single path for mutating channel files.
//!
//! Every physical write of a channel (stores, transfers, transactions log
//! entries, truncations, deletions) goes through a [`StorageWriter`], so a
//! decorator can observe all of them. The backup uses this to mirror the
//! primary files.

use crate::error::{CoreError, CoreResult};
use crate::files::{FileKind, StoredFile};
use crate::types::now_millis;
use shardstore_storage::{copy_range, FileSystem};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Mutating file operations.
pub trait StorageWriter: Send + Sync + fmt::Debug {
    /// Appends `data` to `file`; returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn append(&self, file: &Arc<StoredFile>, data: &[u8]) -> CoreResult<u64>;

    /// Appends `len` bytes of `source` starting at `offset` to `target`;
    /// returns the offset in `target` they were written at.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    fn copy(&self, source: &Arc<StoredFile>, offset: u64, len: u64, target: &Arc<StoredFile>) -> CoreResult<u64>;

    /// Cuts `file` down to `new_length`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is shorter or truncation fails.
    fn truncate(&self, file: &Arc<StoredFile>, new_length: u64) -> CoreResult<()>;

    /// Removes `file` from its directory. Open handles stay readable.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    fn delete(&self, file: &Arc<StoredFile>) -> CoreResult<()>;
}

/// Writes straight to the primary files, optionally keeping deleted files
/// and truncated tails in rescue directories.
#[derive(Debug)]
pub struct DefaultWriter {
    fs: Arc<dyn FileSystem>,
    deletion_directory: Option<PathBuf>,
    truncation_directory: Option<PathBuf>,
}

impl DefaultWriter {
    /// Creates a writer on `fs`.
    #[must_use]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        deletion_directory: Option<PathBuf>,
        truncation_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            fs,
            deletion_directory,
            truncation_directory,
        }
    }

    fn rescue_path(directory: &Path, file: &StoredFile, suffix: &str) -> PathBuf {
        let name = file
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.identity().to_string());
        directory.join(format!("{name}{suffix}"))
    }

    fn rescue_tail(&self, directory: &Path, file: &StoredFile, new_length: u64) -> CoreResult<()> {
        let size = file.size()?;
        if size <= new_length {
            return Ok(());
        }
        let path = Self::rescue_path(directory, file, &format!("_truncated_{new_length}_{}", now_millis()));
        let mut target = self.fs.open(&path)?;
        file.with_backend(|backend| copy_range(&*backend, new_length, size - new_length, target.as_mut()))?;
        target.sync()?;
        info!(file = %file.identity(), rescue = %path.display(), "rescued truncated tail");
        Ok(())
    }
}

impl StorageWriter for DefaultWriter {
    fn append(&self, file: &Arc<StoredFile>, data: &[u8]) -> CoreResult<u64> {
        file.with_backend(|backend| -> CoreResult<u64> {
            let offset = backend.append(data)?;
            backend.flush()?;
            Ok(offset)
        })
    }

    fn copy(&self, source: &Arc<StoredFile>, offset: u64, len: u64, target: &Arc<StoredFile>) -> CoreResult<u64> {
        if Arc::ptr_eq(source, target) {
            return Err(CoreError::consistency(format!(
                "cannot copy {} onto itself",
                source.identity()
            )));
        }
        source.with_backend(|source| {
            target.with_backend(|target| -> CoreResult<u64> {
                let start = copy_range(&*source, offset, len, target)?;
                target.flush()?;
                Ok(start)
            })
        })
    }

    fn truncate(&self, file: &Arc<StoredFile>, new_length: u64) -> CoreResult<()> {
        if let (Some(directory), FileKind::Data(_)) = (&self.truncation_directory, file.identity().kind) {
            self.rescue_tail(directory, file, new_length)?;
        }
        file.with_backend(|backend| -> CoreResult<()> {
            backend.truncate(new_length)?;
            backend.sync()?;
            Ok(())
        })
    }

    fn delete(&self, file: &Arc<StoredFile>) -> CoreResult<()> {
        let result = match (&self.deletion_directory, file.identity().kind) {
            (Some(directory), FileKind::Data(_)) => {
                let target = Self::rescue_path(directory, file, "");
                let target = if self.fs.exists(&target) {
                    Self::rescue_path(directory, file, &format!(".{}", now_millis()))
                } else {
                    target
                };
                self.fs.rename(file.path(), &target)
            }
            _ => self.fs.delete(file.path()),
        };
        match result {
            Err(e) if e.is_not_found() => {
                debug!(file = %file.identity(), "file already gone");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

/// Flushes `file` to durable storage.
pub(crate) fn sync(file: &StoredFile) -> CoreResult<()> {
    file.with_backend(|backend| backend.sync())?;
    Ok(())
}
