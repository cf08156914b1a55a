//! Test fixtures and storage helpers.
//!
//! Provides a restartable storage over an in-memory or temporary on-disk
//! file system, a type dictionary describing a small object graph and a
//! builder for record chunks of that graph.

use bytes::Bytes;
use shardstore_core::{
    encode_entity, CoreResult, FileIdentity, LoadedData, ObjectId, RecordIter, RecordKind, SimpleTypeDictionary,
    StorageConfig, StorageLayout, StorageSystem, TypeDictionary, TypeId, TypeLayout,
};
use shardstore_storage::{FileSystem, InMemoryFileSystem, LocalFileSystem};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Graph roots: the content is an array of references.
pub const ROOT_TYPE: TypeId = TypeId(1);
/// Inner nodes: one reference to a child followed by a payload.
pub const NODE_TYPE: TypeId = TypeId(2);
/// Leaves without references.
pub const BLOB_TYPE: TypeId = TypeId(3);

/// Installs a `tracing` subscriber writing to the test output.
///
/// The filter is read from `RUST_LOG`. Calling it more than once is fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dictionary of [`ROOT_TYPE`], [`NODE_TYPE`] and [`BLOB_TYPE`], with
/// roots as GC roots.
pub fn graph_dictionary() -> Arc<dyn TypeDictionary> {
    let dictionary = SimpleTypeDictionary::with_root_type(ROOT_TYPE);
    let layouts = [
        TypeLayout::new(ROOT_TYPE, "Root").with_reference_array(0),
        TypeLayout::new(NODE_TYPE, "Node")
            .with_references([0])
            .with_content_length(8, u64::MAX),
        TypeLayout::new(BLOB_TYPE, "Blob"),
    ];
    for layout in layouts {
        dictionary
            .register(layout)
            .expect("fresh dictionary accepts every layout");
    }
    Arc::new(dictionary)
}

/// Configuration used by the fixtures: `channel_count` channels and no
/// background housekeeping, so maintenance only runs when issued.
pub fn test_config(base: impl Into<PathBuf>, channel_count: usize) -> StorageConfig {
    StorageConfig::new(base)
        .channel_count(channel_count)
        .housekeeping_interval(Duration::from_secs(3600))
}

/// Builds a chunk of entity records.
///
/// # Example
///
/// ```rust
/// use shardstore_testkit::RecordBuilder;
///
/// let chunk = RecordBuilder::new().root(10, &[11]).node(11, 12, b"x").blob(12, b"leaf").build();
/// assert_eq!(chunk.len(), 24 + 8 + 24 + 9 + 24 + 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    bytes: Vec<u8>,
    object_ids: Vec<ObjectId>,
}

impl RecordBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record of any type.
    #[must_use]
    pub fn entity(mut self, type_id: TypeId, object_id: u64, content: &[u8]) -> Self {
        self.bytes
            .extend_from_slice(&encode_entity(type_id, ObjectId(object_id), content));
        self.object_ids.push(ObjectId(object_id));
        self
    }

    /// Appends a root referencing `references`.
    #[must_use]
    pub fn root(self, object_id: u64, references: &[u64]) -> Self {
        let content: Vec<u8> = references.iter().flat_map(|id| id.to_le_bytes()).collect();
        self.entity(ROOT_TYPE, object_id, &content)
    }

    /// Appends a node referencing `child` (0 for none).
    #[must_use]
    pub fn node(self, object_id: u64, child: u64, payload: &[u8]) -> Self {
        let mut content = child.to_le_bytes().to_vec();
        content.extend_from_slice(payload);
        self.entity(NODE_TYPE, object_id, &content)
    }

    /// Appends a leaf.
    #[must_use]
    pub fn blob(self, object_id: u64, payload: &[u8]) -> Self {
        self.entity(BLOB_TYPE, object_id, payload)
    }

    /// Appends one leaf per ID, all with the same payload.
    #[must_use]
    pub fn blobs(self, object_ids: impl IntoIterator<Item = u64>, payload: &[u8]) -> Self {
        object_ids
            .into_iter()
            .fold(self, |builder, id| builder.blob(id, payload))
    }

    /// Object IDs in the order they were added.
    pub fn object_ids(&self) -> &[ObjectId] {
        &self.object_ids
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    /// Returns true if no record was added.
    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    /// The concatenated records.
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    /// The concatenated records as [`Bytes`], for imports.
    pub fn build_bytes(self) -> Bytes {
        Bytes::from(self.bytes)
    }
}

/// Content of every loaded entity by object ID.
pub fn loaded_contents(loaded: &LoadedData) -> BTreeMap<ObjectId, Vec<u8>> {
    let mut contents = BTreeMap::new();
    for chunk in &loaded.chunks {
        let mut position = 0usize;
        for record in RecordIter::new(chunk, 0) {
            let record = record.expect("loaded chunks hold valid records");
            let length = record.length() as usize;
            if let RecordKind::Entity(header) = record.kind {
                contents.insert(header.object_id, chunk[position + 24..position + length].to_vec());
            }
            position += length;
        }
    }
    contents
}

/// Sorted object IDs of every loaded entity.
pub fn loaded_object_ids(loaded: &LoadedData) -> Vec<u64> {
    loaded_contents(loaded).keys().map(|id| id.0).collect()
}

/// A storage that can be stopped and started again on the same files.
///
/// File-backed storages live in a temporary directory removed on drop and
/// are opened with [`StorageSystem::open`]; the others run on an
/// [`InMemoryFileSystem`] or any given file system.
#[derive(Debug)]
pub struct TestStorage {
    system: Option<StorageSystem>,
    fs: Arc<dyn FileSystem>,
    config: StorageConfig,
    dictionary: Arc<dyn TypeDictionary>,
    temp_dir: Option<TempDir>,
}

impl TestStorage {
    /// Starts a storage with `channel_count` channels in memory.
    pub fn memory(channel_count: usize) -> Self {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        Self::with_file_system(fs, test_config("/storage", channel_count))
            .expect("failed to start in-memory storage")
    }

    /// Starts a storage with `channel_count` channels in a temporary
    /// directory.
    pub fn file(channel_count: usize) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let config = test_config(temp_dir.path().join("storage"), channel_count);
        let mut storage = Self {
            system: None,
            fs: Arc::new(LocalFileSystem::new()),
            config,
            dictionary: graph_dictionary(),
            temp_dir: Some(temp_dir),
        };
        storage.start().expect("failed to start file storage");
        storage
    }

    /// Starts a storage with `config` on `fs` and the graph dictionary.
    ///
    /// # Errors
    ///
    /// Returns the start error of the storage.
    pub fn with_file_system(fs: Arc<dyn FileSystem>, config: StorageConfig) -> CoreResult<Self> {
        let mut storage = Self {
            system: None,
            fs,
            config,
            dictionary: graph_dictionary(),
            temp_dir: None,
        };
        storage.start()?;
        Ok(storage)
    }

    /// The running storage.
    ///
    /// # Panics
    ///
    /// Panics if the storage is stopped.
    pub fn system(&self) -> &StorageSystem {
        self.system.as_ref().expect("storage is stopped")
    }

    /// The file system the storage runs on.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// The configuration used for every start.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns true between [`TestStorage::start`] and [`TestStorage::stop`].
    pub fn is_started(&self) -> bool {
        self.system.is_some()
    }

    /// Starts the storage if it is stopped.
    ///
    /// # Errors
    ///
    /// Returns the start error of the storage.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.system.is_none() {
            let system = if self.temp_dir.is_some() {
                StorageSystem::open(self.config.clone(), Arc::clone(&self.dictionary))?
            } else {
                StorageSystem::start(self.config.clone(), Arc::clone(&self.fs), Arc::clone(&self.dictionary))?
            };
            self.system = Some(system);
        }
        Ok(())
    }

    /// Shuts the storage down, keeping its files.
    ///
    /// # Errors
    ///
    /// Returns the shutdown error of the storage.
    pub fn stop(&mut self) -> CoreResult<()> {
        match self.system.take() {
            Some(system) => system.shutdown(),
            None => Ok(()),
        }
    }

    /// Stops and starts the storage.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown or start error.
    pub fn restart(&mut self) -> CoreResult<()> {
        self.stop()?;
        self.start()
    }

    /// Path of a data file.
    pub fn data_file_path(&self, channel: usize, number: u64) -> PathBuf {
        self.file_layout().path(FileIdentity::data(channel, number))
    }

    /// Path of a channel's transactions log.
    pub fn transactions_path(&self, channel: usize) -> PathBuf {
        self.file_layout().path(FileIdentity::transactions(channel))
    }

    /// Root directory of the storage.
    pub fn base_directory(&self) -> &Path {
        self.config.base_directory()
    }

    /// Number of data files on disk across all channels.
    pub fn data_file_count(&self) -> usize {
        (0..self.config.channel_count)
            .map(|channel| {
                self.file_layout()
                    .inventory(self.fs.as_ref(), channel)
                    .expect("channel directory is readable")
                    .data_files
                    .len()
            })
            .sum()
    }

    /// File layout of the storage, usable while it is stopped.
    pub fn file_layout(&self) -> StorageLayout {
        StorageLayout::new(self.config.base_directory.clone(), self.config.naming.clone())
    }
}

impl std::ops::Deref for TestStorage {
    type Target = StorageSystem;

    fn deref(&self) -> &Self::Target {
        self.system()
    }
}

/// Runs a test with a temporary in-memory storage.
///
/// # Example
///
/// ```rust
/// use shardstore_testkit::{with_temp_storage, RecordBuilder};
///
/// with_temp_storage(2, |storage| {
///     storage.store(&RecordBuilder::new().blob(1, b"a").build()).unwrap();
/// });
/// ```
pub fn with_temp_storage<F, R>(channel_count: usize, f: F) -> R
where
    F: FnOnce(&StorageSystem) -> R,
{
    let storage = TestStorage::memory(channel_count);
    f(storage.system())
}

/// Runs a test with a storage in a temporary directory.
pub fn with_file_storage<F, R>(channel_count: usize, f: F) -> R
where
    F: FnOnce(&StorageSystem, &Path) -> R,
{
    let storage = TestStorage::file(channel_count);
    f(storage.system(), storage.base_directory())
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Object ID of the root stored by [`populated_storage`].
    pub fn root_id(entity_count: u64) -> u64 {
        entity_count + 1
    }

    /// Records for leaves `1..=entity_count` and a root referencing all
    /// of them.
    pub fn reachable_blobs(entity_count: u64, payload: &[u8]) -> Vec<u8> {
        let ids: Vec<u64> = (1..=entity_count).collect();
        RecordBuilder::new()
            .blobs(ids.iter().copied(), payload)
            .root(root_id(entity_count), &ids)
            .build()
    }

    /// Creates an in-memory storage holding [`reachable_blobs`].
    pub fn populated_storage(channel_count: usize, entity_count: u64) -> TestStorage {
        let storage = TestStorage::memory(channel_count);
        storage
            .store(&reachable_blobs(entity_count, b"populated"))
            .expect("failed to populate storage");
        storage
    }

    /// Records of a chain `root -> node(first) -> ... -> blob(last)`.
    pub fn chain(root: u64, first: u64, length: u64) -> Vec<u8> {
        let mut builder = RecordBuilder::new().root(root, &[first]);
        for id in first..first + length - 1 {
            builder = builder.node(id, id + 1, b"link");
        }
        builder.blob(first + length - 1, b"end").build()
    }
}
