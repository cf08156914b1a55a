//! Path-level file-system operations.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory and file operations the engine needs beyond one open file.
///
/// Handles returned by [`FileSystem::open`] stay usable after the path has
/// been deleted or renamed, the same way an open OS file does on Unix. The
/// engine relies on this to let the backup thread finish reading a file the
/// channel has already retired.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Opens the file at `path` for reading and appending, creating it (and
    /// its parent directories) if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns true if a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Returns the size of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such file.
    fn file_size(&self, path: &Path) -> StorageResult<u64>;

    /// Creates `path` and all missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Lists the regular files directly inside `dir`, sorted by path.
    ///
    /// A missing directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Lists the directories directly inside `dir`, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list_dirs(&self, dir: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Deletes the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be removed.
    fn delete(&self, path: &Path) -> StorageResult<()>;

    /// Moves the file at `from` to `to`. The target must not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing, the target exists or the
    /// move fails.
    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Reads the whole file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unreadable.
    fn read_all(&self, path: &Path) -> StorageResult<Vec<u8>>;

    /// Replaces the content of the file at `path` with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write_all(&self, path: &Path, data: &[u8]) -> StorageResult<()>;
}

/// [`FileSystem`] over the operating system's files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Creates the local file system handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn list_entries(dir: &Path, want_dirs: bool) -> StorageResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if (want_dirs && file_type.is_dir()) || (!want_dirs && file_type.is_file()) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_with_create_dirs(path)?))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        list_entries(dir, false)
    }

    fn list_dirs(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        list_entries(dir, true)
    }

    fn delete(&self, path: &Path) -> StorageResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if !from.is_file() {
            return Err(StorageError::NotFound(from.to_path_buf()));
        }
        if to.exists() {
            return Err(StorageError::AlreadyExists(to.to_path_buf()));
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn read_all(&self, path: &Path) -> StorageResult<Vec<u8>> {
        match std::fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }
}
