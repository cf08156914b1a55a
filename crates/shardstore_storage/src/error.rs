//! Error types for file-system operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by backends and file systems.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a file.
    #[error("read beyond end of file: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current file size.
        size: u64,
    },

    /// Attempted to truncate a file to a length greater than its size.
    #[error("cannot truncate to {new_size}, file size is only {size}")]
    TruncatePastEnd {
        /// The requested length.
        new_size: u64,
        /// The current file size.
        size: u64,
    },

    /// The path does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The target of a rename or copy already exists.
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),
}

impl StorageError {
    /// Returns true if this error means the file was simply not there.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
