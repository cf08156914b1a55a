//! Data files and transactions logs on the local disk.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct OpenFile {
    file: File,
    /// Bytes appended so far; the next append lands here.
    length: u64,
}

/// A [`StorageBackend`] over one OS file opened in append mode.
///
/// Appends always go to the end of the file, also after a truncation.
/// Reads seek, so they share one lock with the handle. The length is kept
/// in memory: range checks and `size` never touch file metadata.
///
/// `sync` is `File::sync_all`; a truncation is synced before it returns.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    open: Mutex<OpenFile>,
}

impl FileBackend {
    /// Opens the file at `path`, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).append(true).create(true).open(path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            open: Mutex::new(OpenFile { file, length }),
        })
    }

    /// Like [`FileBackend::open`], creating a missing channel directory
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path this backend was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut open = self.open.lock();
        let size = open.length;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let mut buffer = vec![0u8; len];
        if len > 0 {
            open.file.seek(SeekFrom::Start(offset))?;
            open.file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let open = self.open.get_mut();
        let offset = open.length;
        open.file.write_all(data)?;
        open.length += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(self.open.get_mut().file.flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.open.lock().length)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(self.open.get_mut().file.sync_all()?)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let open = self.open.get_mut();
        if new_size > open.length {
            return Err(StorageError::TruncatePastEnd {
                new_size,
                size: open.length,
            });
        }
        open.file.set_len(new_size)?;
        open.file.sync_data()?;
        open.length = new_size;
        Ok(())
    }
}
