//! In-memory backend and file system for tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::fs::FileSystem;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// An in-memory [`StorageBackend`].
///
/// Backends opened from the same [`InMemoryFileSystem`] path share one
/// buffer, so writes through one handle are visible through the others.
///
/// # Example
///
/// ```rust
/// use shardstore_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// assert_eq!(backend.append(b"record").unwrap(), 0);
/// assert_eq!(backend.size().unwrap(), 6);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: SharedBuffer,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    fn shared(data: SharedBuffer) -> Self {
        Self { data }
    }

    /// Returns a copy of the content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd { new_size, size });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, SharedBuffer>,
    dirs: BTreeSet<PathBuf>,
}

impl Tree {
    fn add_parents(&mut self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() || !self.dirs.insert(dir.to_path_buf()) {
                break;
            }
            current = dir.parent();
        }
    }
}

/// A [`FileSystem`] kept entirely in memory.
///
/// Cloning yields another handle to the same tree.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFileSystem {
    tree: Arc<RwLock<Tree>>,
}

impl InMemoryFileSystem {
    /// Creates an empty file system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of files currently stored.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.tree.read().files.len()
    }
}

impl FileSystem for InMemoryFileSystem {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        let mut tree = self.tree.write();
        tree.add_parents(path);
        let buffer = tree
            .files
            .entry(path.to_path_buf())
            .or_insert_with(SharedBuffer::default)
            .clone();
        Ok(Box::new(InMemoryBackend::shared(buffer)))
    }

    fn exists(&self, path: &Path) -> bool {
        self.tree.read().files.contains_key(path)
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        self.tree
            .read()
            .files
            .get(path)
            .map(|buffer| buffer.read().len() as u64)
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        let mut tree = self.tree.write();
        tree.dirs.insert(path.to_path_buf());
        tree.add_parents(path);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        Ok(self
            .tree
            .read()
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn list_dirs(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        Ok(self
            .tree
            .read()
            .dirs
            .iter()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &Path) -> StorageResult<()> {
        self.tree
            .write()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let mut tree = self.tree.write();
        if tree.files.contains_key(to) {
            return Err(StorageError::AlreadyExists(to.to_path_buf()));
        }
        let buffer = tree
            .files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_path_buf()))?;
        tree.add_parents(to);
        tree.files.insert(to.to_path_buf(), buffer);
        Ok(())
    }

    fn read_all(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.tree
            .read()
            .files
            .get(path)
            .map(|buffer| buffer.read().clone())
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut tree = self.tree.write();
        tree.add_parents(path);
        let buffer = tree
            .files
            .entry(path.to_path_buf())
            .or_insert_with(SharedBuffer::default)
            .clone();
        let mut content = buffer.write();
        content.clear();
        content.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_handles_share_content() {
        let fs = InMemoryFileSystem::new();
        let path = Path::new("root/channel_0/channel_0_1.dat");
        let mut writer = fs.open(path).unwrap();
        let reader = fs.open(path).unwrap();

        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_at(0, 6).unwrap(), b"shared");
        assert_eq!(fs.file_size(path).unwrap(), 6);
    }

    #[test]
    fn memory_deleted_file_stays_readable_through_handle() {
        let fs = InMemoryFileSystem::new();
        let path = Path::new("a.dat");
        let mut handle = fs.open(path).unwrap();
        handle.append(b"still here").unwrap();

        fs.delete(path).unwrap();
        assert!(!fs.exists(path));
        assert_eq!(handle.read_at(0, 5).unwrap(), b"still");
    }

    #[test]
    fn memory_lists_direct_children_only() {
        let fs = InMemoryFileSystem::new();
        fs.open(Path::new("root/channel_0/channel_0_1.dat")).unwrap();
        fs.open(Path::new("root/channel_0/transactions_0.sft")).unwrap();
        fs.open(Path::new("root/channel_1/channel_1_1.dat")).unwrap();

        let files = fs.list_files(Path::new("root/channel_0")).unwrap();
        assert_eq!(files.len(), 2);
        let dirs = fs.list_dirs(Path::new("root")).unwrap();
        assert_eq!(
            dirs,
            vec![PathBuf::from("root/channel_0"), PathBuf::from("root/channel_1")]
        );
    }

    #[test]
    fn memory_rename_moves_buffer() {
        let fs = InMemoryFileSystem::new();
        fs.write_all(Path::new("a"), b"payload").unwrap();
        fs.rename(Path::new("a"), Path::new("rescue/a")).unwrap();

        assert!(!fs.exists(Path::new("a")));
        assert_eq!(fs.read_all(Path::new("rescue/a")).unwrap(), b"payload");
        assert_eq!(fs.file_count(), 1);
    }

    #[test]
    fn memory_truncate_past_end_fails() {
        let mut backend = InMemoryBackend::with_data(vec![0; 4]);
        assert!(matches!(
            backend.truncate(5),
            Err(StorageError::TruncatePastEnd { new_size: 5, size: 4 })
        ));
    }

    proptest! {
        #[test]
        fn memory_appends_concatenate(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let mut backend = InMemoryBackend::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = backend.append(chunk).unwrap();
                prop_assert_eq!(offset, expected.len() as u64);
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(backend.data(), expected);
        }
    }
}
