//! The running storage.
//!
//! [`StorageSystem`] starts one thread per channel, the optional backup
//! thread and the lock file heartbeat, initializes every channel from its
//! files and then turns each public operation into a task processed by all
//! channels. Operations block until every channel completed their task.

use crate::backup::{BackupHandler, BackupTarget, BackupWriter};
use crate::cache::EntityCache;
use crate::channel::{Channel, IdAnalysis};
use crate::chunk::{partition, GapPolicy};
use crate::config::StorageConfig;
use crate::controller::OperationController;
use crate::dictionary::TypeDictionary;
use crate::error::{CoreError, CoreResult, ErrorCollector};
use crate::files::StorageLayout;
use crate::gc::evaluator::EntityCacheEvaluator;
use crate::gc::monitor::MarkMonitor;
use crate::live::initializer::{consistent_timestamp, max_logged_timestamp};
use crate::live::FileContext;
use crate::lock::LockFileManager;
use crate::stats::{RawFileStatistics, StatsSnapshot, StorageStats};
use crate::task::requests::{
    AnalyzeTask, ExportChannelsTask, ExportTypesTask, ExportedType, InitializeTask, LoadRequest, LoadTask,
    LoadedData, Maintenance, MaintenanceTask, ShutdownTask, StatisticsTask, WriteTask,
};
use crate::task::{ChannelTask, TaskBroker, TaskCore};
use crate::types::{now_millis, ObjectId, TypeId};
use crate::writer::{DefaultWriter, StorageWriter};
use bytes::Bytes;
use parking_lot::Mutex;
use shardstore_storage::{FileSystem, LocalFileSystem};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A started storage.
///
/// # Example
///
/// ```rust,ignore
/// use shardstore_core::{SimpleTypeDictionary, StorageConfig, StorageSystem};
/// use std::sync::Arc;
///
/// let storage = StorageSystem::open(StorageConfig::new("data").channel_count(4), Arc::new(dictionary))?;
/// storage.store(&records)?;
/// let loaded = storage.load_by_object_ids(&[ObjectId(1000)])?;
/// storage.shutdown()?;
/// ```
#[derive(Debug)]
pub struct StorageSystem {
    config: StorageConfig,
    fs: Arc<dyn FileSystem>,
    layout: StorageLayout,
    dictionary: Arc<dyn TypeDictionary>,
    controller: Arc<OperationController>,
    broker: Arc<TaskBroker>,
    stats: Arc<StorageStats>,
    channels: Mutex<Vec<JoinHandle<()>>>,
    backup: Mutex<Option<BackupHandler>>,
    lock: Mutex<Option<LockFileManager>>,
    id_analysis: IdAnalysis,
}

impl StorageSystem {
    /// Starts a storage on the local file system.
    ///
    /// # Errors
    ///
    /// See [`StorageSystem::start`].
    pub fn open(config: StorageConfig, dictionary: Arc<dyn TypeDictionary>) -> CoreResult<Self> {
        Self::launch(config, Arc::new(LocalFileSystem::new()), dictionary, true)
    }

    /// Starts a storage on `fs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, another process
    /// holds the lock file, the backup does not match the primary files or
    /// any channel fails to initialize. Nothing keeps running on error.
    pub fn start(
        config: StorageConfig,
        fs: Arc<dyn FileSystem>,
        dictionary: Arc<dyn TypeDictionary>,
    ) -> CoreResult<Self> {
        Self::launch(config, fs, dictionary, false)
    }

    fn launch(
        config: StorageConfig,
        fs: Arc<dyn FileSystem>,
        dictionary: Arc<dyn TypeDictionary>,
        advisory_lock: bool,
    ) -> CoreResult<Self> {
        config.validate()?;
        let channel_count = config.channel_count;
        let layout = StorageLayout::new(config.base_directory.clone(), config.naming.clone());
        let controller = Arc::new(OperationController::new());
        fs.create_dir_all(layout.base())?;

        let lock = if config.lock_file.enabled {
            Some(LockFileManager::acquire(
                Arc::clone(&fs),
                &layout.lock_file(),
                &config.lock_file,
                advisory_lock,
                Arc::clone(&controller),
            )?)
        } else {
            None
        };

        let mut writer: Arc<dyn StorageWriter> = Arc::new(DefaultWriter::new(
            Arc::clone(&fs),
            config.deletion_directory.clone(),
            config.truncation_directory.clone(),
        ));
        let backup = match &config.backup {
            Some(backup) => {
                let target = BackupTarget::new(Arc::clone(&fs), &layout, backup);
                let handler = BackupHandler::start(
                    target,
                    &layout,
                    channel_count,
                    backup.poll_interval,
                    Arc::clone(&controller),
                )?;
                writer = Arc::new(BackupWriter::new(writer, Arc::clone(handler.queue())));
                Some(handler)
            }
            None => None,
        };

        controller.activate();
        let stats = Arc::new(StorageStats::new());
        let broker = Arc::new(TaskBroker::new(channel_count, Arc::clone(&controller)));
        let monitor = Arc::new(MarkMonitor::new(channel_count, config.gc.mark_segment_length));
        let evaluator: Arc<dyn EntityCacheEvaluator> = Arc::new(config.cache);

        let mut system = Self {
            fs: Arc::clone(&fs),
            layout: layout.clone(),
            dictionary: Arc::clone(&dictionary),
            controller: Arc::clone(&controller),
            broker: Arc::clone(&broker),
            stats: Arc::clone(&stats),
            channels: Mutex::new(Vec::with_capacity(channel_count)),
            backup: Mutex::new(backup),
            lock: Mutex::new(lock),
            id_analysis: IdAnalysis::default(),
            config,
        };

        for index in 0..channel_count {
            let ctx = FileContext {
                channel: index,
                channel_count,
                fs: Arc::clone(&fs),
                layout: layout.clone(),
                writer: Arc::clone(&writer),
                evaluator: system.config.data_files,
                stats: Arc::clone(&stats),
            };
            let cache = EntityCache::new(
                index,
                Arc::clone(&dictionary),
                Arc::clone(&evaluator),
                Arc::clone(&monitor),
                &system.config.gc,
                Arc::clone(&stats),
            );
            let channel = Channel::new(ctx, cache, Arc::clone(&monitor), system.config.housekeeping);
            let broker = Arc::clone(&broker);
            let controller = Arc::clone(&controller);
            let spawned = thread::Builder::new()
                .name(format!("shardstore-channel-{index}"))
                .spawn(move || channel.run(&broker, &controller));
            match spawned {
                Ok(handle) => system.channels.lock().push(handle),
                Err(e) => {
                    system.abort();
                    return Err(e.into());
                }
            }
        }

        match system.initialize() {
            Ok(id_analysis) => {
                info!(
                    base = %system.layout.base().display(),
                    channels = channel_count,
                    highest_object_id = %id_analysis.highest_object_id,
                    "storage started"
                );
                system.id_analysis = id_analysis;
                Ok(system)
            }
            Err(e) => {
                system.abort();
                Err(e)
            }
        }
    }

    fn initialize(&self) -> CoreResult<IdAnalysis> {
        let channel_count = self.config.channel_count;
        let analyze = self.run(|core| AnalyzeTask::new(core, channel_count))?;
        let analyses = analyze.analyses();
        let consistent = consistent_timestamp(&analyses);
        self.broker.raise_timestamp_floor(max_logged_timestamp(&analyses));
        debug!(consistent, "channels analyzed");
        let initialize = self.run(|core| InitializeTask::new(core, channel_count, consistent))?;
        Ok(initialize.id_analysis())
    }

    /// Issues a task and waits until every channel completed it.
    fn run<T>(&self, make: impl FnOnce(TaskCore) -> T) -> CoreResult<Arc<T>>
    where
        T: ChannelTask + 'static,
    {
        let task = self.broker.submit(make)?;
        if let Err(e) = task.core().wait_on_completion() {
            self.stats.record_failed_task();
            return Err(e);
        }
        Ok(task)
    }

    /// The configuration the storage was started with.
    #[must_use]
    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// File naming below the base directory.
    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Highest object ID and type IDs found at startup.
    #[must_use]
    pub const fn id_analysis(&self) -> &IdAnalysis {
        &self.id_analysis
    }

    /// Returns true until the storage is shut down or disrupted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Problems that stopped the storage.
    #[must_use]
    pub fn disruptions(&self) -> Vec<Arc<CoreError>> {
        self.controller.disruptions()
    }

    /// Current operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stores the entity records of `chunk`.
    ///
    /// Either every record is stored or none is.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a record is invalid, before anything
    /// is written, or the first channel's problem if writing fails.
    pub fn store(&self, chunk: &[u8]) -> CoreResult<()> {
        let partitions = partition(
            [chunk],
            self.config.channel_count,
            self.dictionary.as_ref(),
            GapPolicy::Reject,
        )?;
        let (entities, bytes) = (partitions.entity_count() as u64, partitions.byte_count());
        self.run(|core| WriteTask::store(core, partitions))?;
        self.stats.record_store(entities, bytes);
        Ok(())
    }

    fn load(&self, request: LoadRequest) -> CoreResult<LoadedData> {
        let channel_count = self.config.channel_count;
        let task = self.run(|core| LoadTask::new(core, channel_count, request))?;
        let loaded = task.loaded();
        self.stats.record_load(loaded.byte_count());
        Ok(loaded)
    }

    /// Loads the entities with the given object IDs.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails to read.
    pub fn load_by_object_ids(&self, object_ids: &[ObjectId]) -> CoreResult<LoadedData> {
        self.load(LoadRequest::ObjectIds(object_ids.to_vec()))
    }

    /// Loads every entity of the given types.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails to read.
    pub fn load_by_type_ids(&self, type_ids: &[TypeId]) -> CoreResult<LoadedData> {
        self.load(LoadRequest::TypeIds(type_ids.to_vec()))
    }

    /// Loads every root entity; `root_object_id` names the newest.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails to read.
    pub fn load_roots(&self) -> CoreResult<LoadedData> {
        self.load(LoadRequest::Roots)
    }

    fn maintain(&self, kind: Maintenance, budget: Option<Duration>) -> CoreResult<bool> {
        let channel_count = self.config.channel_count;
        let deadline = budget.map(|budget| Instant::now() + budget);
        let task = self.run(|core| MaintenanceTask::new(core, channel_count, kind, deadline))?;
        Ok(task.completed())
    }

    /// Runs garbage collection, without limit if `budget` is `None`.
    ///
    /// Returns true if a full mark and sweep completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails.
    pub fn issue_garbage_collection(&self, budget: Option<Duration>) -> CoreResult<bool> {
        self.maintain(Maintenance::GarbageCollection, budget)
    }

    /// Consolidates data files and compacts transactions logs.
    ///
    /// Returns true if every channel finished within the budget.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails.
    pub fn issue_file_check(&self, budget: Option<Duration>) -> CoreResult<bool> {
        self.maintain(Maintenance::FileCheck, budget)
    }

    /// Evicts cached entity bytes, judged by `evaluator` or the configured
    /// evaluator.
    ///
    /// Returns true if every channel finished within the budget.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails.
    pub fn issue_cache_check(
        &self,
        budget: Option<Duration>,
        evaluator: Option<Arc<dyn EntityCacheEvaluator>>,
    ) -> CoreResult<bool> {
        self.maintain(Maintenance::CacheCheck(evaluator), budget)
    }

    /// Copies every channel's data files and transactions log below
    /// `target`, optionally after a full garbage collection.
    ///
    /// # Errors
    ///
    /// Returns an error if copying fails.
    pub fn export_channels(&self, target: &Path, run_gc_first: bool) -> CoreResult<()> {
        if run_gc_first {
            let channel_count = self.config.channel_count;
            self.broker
                .submit(|core| MaintenanceTask::new(core, channel_count, Maintenance::GarbageCollection, None))?;
        }
        let layout = self.layout.with_base(target);
        self.run(|core| ExportChannelsTask::new(core, layout))?;
        info!(target = %target.display(), "channels exported");
        Ok(())
    }

    /// Writes the entities of every type, or of the types in `filter`, to
    /// one file per type below `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn export_types(
        &self,
        directory: &Path,
        filter: Option<BTreeSet<TypeId>>,
    ) -> CoreResult<Vec<ExportedType>> {
        let directory = directory.to_path_buf();
        let task = self.run(|core| ExportTypesTask::new(core, directory, filter))?;
        Ok(task.exported())
    }

    fn import(&self, chunks: &[&[u8]]) -> CoreResult<()> {
        let partitions = partition(
            chunks.iter().copied(),
            self.config.channel_count,
            self.dictionary.as_ref(),
            GapPolicy::Skip,
        )?;
        let entities = partitions.entity_count();
        self.run(|core| WriteTask::import(core, partitions))?;
        info!(entities, "import committed");
        Ok(())
    }

    /// Imports the entity records of data files, e.g. written by
    /// [`StorageSystem::export_types`] or taken from another storage.
    /// Gaps are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read, holds invalid records or
    /// writing fails. Nothing is imported on error.
    pub fn import_files(&self, sources: &[PathBuf]) -> CoreResult<()> {
        let contents = sources
            .iter()
            .map(|source| self.fs.read_all(source))
            .collect::<Result<Vec<_>, _>>()?;
        let chunks: Vec<&[u8]> = contents.iter().map(Vec::as_slice).collect();
        self.import(&chunks)
    }

    /// Imports entity records held in memory. Gaps are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer holds invalid records or writing
    /// fails. Nothing is imported on error.
    pub fn import_buffers(&self, sources: &[Bytes]) -> CoreResult<()> {
        let chunks: Vec<&[u8]> = sources.iter().map(Bytes::as_ref).collect();
        self.import(&chunks)
    }

    /// Per-file entity counts and lengths of every channel.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel fails.
    pub fn create_raw_file_statistics(&self) -> CoreResult<RawFileStatistics> {
        let channel_count = self.config.channel_count;
        let task = self.run(|core| StatisticsTask::new(core, channel_count))?;
        Ok(RawFileStatistics::new(now_millis(), task.channels()))
    }

    /// Flushes every file and stops all threads.
    ///
    /// Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Returns every problem met while stopping, including backup failures.
    pub fn shutdown(&self) -> CoreResult<()> {
        let mut collector = ErrorCollector::new();
        if self.controller.is_running() {
            collector.collect(self.run(ShutdownTask::new).map(|_| ()));
        }
        self.stop_threads(&mut collector);
        if collector.is_empty() {
            info!(base = %self.layout.base().display(), "storage shut down");
        }
        collector.finish("storage shutdown failed")
    }

    fn stop_threads(&self, collector: &mut ErrorCollector) {
        self.controller.deactivate();
        self.broker.wake_all();
        for handle in self.channels.lock().drain(..) {
            if handle.join().is_err() {
                collector.push(Arc::new(CoreError::consistency("channel thread panicked")));
            }
        }
        if let Some(mut backup) = self.backup.lock().take() {
            debug!(pending = backup.queue().len(), "stopping backup");
            collector.collect(backup.shutdown());
        }
        if let Some(mut lock) = self.lock.lock().take() {
            collector.collect(lock.release());
        }
    }

    /// Stops everything after a failed start.
    fn abort(&self) {
        let mut collector = ErrorCollector::new();
        self.stop_threads(&mut collector);
        if let Err(e) = collector.finish("aborted start") {
            warn!(error = %e, "problems while aborting start");
        }
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        if self.channels.lock().is_empty() {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "storage dropped with problems");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{encode_entity, RecordIter, RecordKind};
    use crate::config::BackupConfig;
    use crate::dictionary::{SimpleTypeDictionary, TypeLayout};
    use crate::files::FileIdentity;
    use shardstore_storage::InMemoryFileSystem;

    const LEAF: TypeId = TypeId(7);

    fn dictionary() -> Arc<dyn TypeDictionary> {
        let dictionary = SimpleTypeDictionary::new();
        dictionary.register(TypeLayout::new(LEAF, "Leaf")).unwrap();
        Arc::new(dictionary)
    }

    fn config(channels: usize) -> StorageConfig {
        StorageConfig::new("/store")
            .channel_count(channels)
            .housekeeping_interval(Duration::from_secs(3600))
    }

    fn records(ids: &[u64], content: &[u8]) -> Vec<u8> {
        ids.iter()
            .flat_map(|id| encode_entity(LEAF, ObjectId(*id), content))
            .collect()
    }

    fn object_ids(loaded: &LoadedData) -> Vec<u64> {
        let mut ids: Vec<u64> = loaded
            .chunks
            .iter()
            .flat_map(|chunk| {
                RecordIter::new(chunk, 0).filter_map(|record| match record.unwrap().kind {
                    RecordKind::Entity(header) => Some(header.object_id.0),
                    RecordKind::Gap(_) => None,
                })
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    fn start(fs: &Arc<InMemoryFileSystem>, config: StorageConfig) -> StorageSystem {
        StorageSystem::start(config, Arc::clone(fs) as Arc<dyn FileSystem>, dictionary()).unwrap()
    }

    #[test]
    fn store_load_and_restart() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(4));
        storage.store(&records(&[1, 2, 3, 4, 5], b"payload")).unwrap();

        let loaded = storage.load_by_object_ids(&[ObjectId(2), ObjectId(5), ObjectId(99)]).unwrap();
        assert_eq!(object_ids(&loaded), vec![2, 5]);
        assert_eq!(loaded.missing, vec![ObjectId(99)]);
        assert_eq!(storage.stats().stores, 1);
        storage.shutdown().unwrap();
        assert!(!storage.is_running());
        storage.shutdown().unwrap();

        let storage = start(&fs, config(4));
        assert_eq!(storage.id_analysis().highest_object_id, ObjectId(5));
        assert!(storage.id_analysis().type_ids.contains(&LEAF));
        let loaded = storage.load_by_type_ids(&[LEAF]).unwrap();
        assert_eq!(object_ids(&loaded), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn invalid_store_is_rejected_and_storage_keeps_running() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(2));
        let invalid = encode_entity(TypeId(99), ObjectId(1), b"x");
        assert!(storage.store(&invalid).unwrap_err().is_validation());
        assert!(storage.is_running());
        storage.store(&records(&[1], b"x")).unwrap();
    }

    #[test]
    fn invalid_configuration_fails_start() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let result = StorageSystem::start(config(3), fs as Arc<dyn FileSystem>, dictionary());
        assert!(matches!(result, Err(CoreError::InvalidConfiguration { .. })));
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(1));
        storage.shutdown().unwrap();
        assert!(matches!(storage.store(&records(&[1], b"x")), Err(CoreError::NotRunning)));
        assert!(!fs.exists(&storage.layout().lock_file()));
    }

    #[test]
    fn second_storage_on_same_directory_collides() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let mut first_config = config(1);
        first_config.lock_file.identifier = Some("first".into());
        first_config.lock_file.update_interval = Duration::from_millis(20);
        let _first = start(&fs, first_config);

        let mut second_config = config(1);
        second_config.lock_file.identifier = Some("second".into());
        second_config.lock_file.update_interval = Duration::from_millis(20);
        let result = StorageSystem::start(second_config, fs as Arc<dyn FileSystem>, dictionary());
        assert!(matches!(result, Err(CoreError::StorageLocked { .. })));
    }

    #[test]
    fn maintenance_and_statistics() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(2));
        storage.store(&records(&[1, 2, 3], b"first")).unwrap();
        storage.store(&records(&[1, 2, 3], b"second-version")).unwrap();

        assert!(storage.issue_garbage_collection(None).unwrap());
        assert!(storage.issue_file_check(None).unwrap());
        assert!(storage.issue_cache_check(None, None).unwrap());

        let statistics = storage.create_raw_file_statistics().unwrap();
        assert_eq!(statistics.channels.len(), 2);
        let loaded = storage.load_by_object_ids(&[ObjectId(1)]).unwrap();
        assert_eq!(loaded.byte_count(), records(&[1], b"second-version").len() as u64);
    }

    #[test]
    fn export_and_import_round_trip() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(2));
        storage.store(&records(&[1, 2, 3], b"data")).unwrap();

        storage.export_channels(Path::new("/export"), true).unwrap();
        let exported = storage.layout().with_base("/export");
        assert!(fs.exists(&exported.path(FileIdentity::transactions(0))));

        let types = storage.export_types(Path::new("/types"), None).unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].entity_count, 3);
        storage.shutdown().unwrap();

        let target = start(&fs, StorageConfig::new("/copy").channel_count(4).housekeeping_interval(Duration::from_secs(3600)));
        target.import_files(&[types[0].path.clone()]).unwrap();
        let loaded = target.load_by_type_ids(&[LEAF]).unwrap();
        assert_eq!(object_ids(&loaded), vec![1, 2, 3]);

        let buffer = Bytes::from(records(&[10], b"buffered"));
        target.import_buffers(&[buffer]).unwrap();
        assert_eq!(object_ids(&target.load_by_object_ids(&[ObjectId(10)]).unwrap()), vec![10]);
    }

    #[test]
    fn backup_mirrors_the_storage() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let storage = start(&fs, config(2).backup(BackupConfig::new("/backup")));
        storage.store(&records(&[1, 2, 3, 4], b"mirrored")).unwrap();
        storage.shutdown().unwrap();

        let backup = storage.layout().with_base("/backup");
        for channel in 0..2 {
            let primary = storage.layout().inventory(fs.as_ref(), channel).unwrap();
            assert_eq!(backup.inventory(fs.as_ref(), channel).unwrap(), primary);
            for number in primary.data_files.keys() {
                let identity = FileIdentity::data(channel, *number);
                assert_eq!(
                    fs.read_all(&backup.path(identity)).unwrap(),
                    fs.read_all(&storage.layout().path(identity)).unwrap()
                );
            }
        }
    }
}
