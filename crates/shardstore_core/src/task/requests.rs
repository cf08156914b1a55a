//! The concrete tasks behind the storage operations.

use super::{ChannelTask, TaskCore};
use crate::channel::{Channel, ChannelLoad, IdAnalysis};
use crate::chunk::Partitions;
use crate::error::CoreResult;
use crate::files::StorageLayout;
use crate::gc::evaluator::EntityCacheEvaluator;
use crate::live::initializer::ChannelAnalysis;
use crate::stats::ChannelStatistics;
use crate::types::{ObjectId, TypeId};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One result slot per channel.
#[derive(Debug)]
struct Slots<T>(Mutex<Vec<Option<T>>>);

impl<T> Slots<T> {
    fn new(channel_count: usize) -> Self {
        Self(Mutex::new((0..channel_count).map(|_| None).collect()))
    }

    fn put(&self, channel: usize, value: T) {
        if let Some(slot) = self.0.lock().get_mut(channel) {
            *slot = Some(value);
        }
    }

    /// Takes the results in channel order, skipping channels without one.
    fn take_all(&self) -> Vec<T> {
        self.0.lock().iter_mut().filter_map(Option::take).collect()
    }
}

/// First startup step: replay of every channel's log.
#[derive(Debug)]
pub(crate) struct AnalyzeTask {
    core: TaskCore,
    analyses: Slots<ChannelAnalysis>,
}

impl AnalyzeTask {
    pub(crate) fn new(core: TaskCore, channel_count: usize) -> Self {
        Self {
            core,
            analyses: Slots::new(channel_count),
        }
    }

    pub(crate) fn analyses(&self) -> Vec<ChannelAnalysis> {
        self.analyses.take_all()
    }
}

impl ChannelTask for AnalyzeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let analysis = channel.analyze()?;
        self.analyses.put(channel.index(), analysis);
        Ok(())
    }
}

/// Second startup step: repair and entity registration.
#[derive(Debug)]
pub(crate) struct InitializeTask {
    core: TaskCore,
    consistent_timestamp: i64,
    results: Slots<IdAnalysis>,
}

impl InitializeTask {
    pub(crate) fn new(core: TaskCore, channel_count: usize, consistent_timestamp: i64) -> Self {
        Self {
            core,
            consistent_timestamp,
            results: Slots::new(channel_count),
        }
    }

    pub(crate) fn id_analysis(&self) -> IdAnalysis {
        self.results
            .take_all()
            .into_iter()
            .fold(IdAnalysis::default(), |mut all, channel| {
                all.merge(channel);
                all
            })
    }
}

impl ChannelTask for InitializeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let analysis = channel.initialize(self.consistent_timestamp, self.core.timestamp())?;
        self.results.put(channel.index(), analysis);
        Ok(())
    }
}

/// Writes a store or import: every channel writes its partition, then all
/// commit or all roll back.
#[derive(Debug)]
pub(crate) struct WriteTask {
    core: TaskCore,
    partitions: Partitions,
    import: bool,
}

impl WriteTask {
    pub(crate) fn store(core: TaskCore, partitions: Partitions) -> Self {
        Self {
            core,
            partitions,
            import: false,
        }
    }

    pub(crate) fn import(core: TaskCore, partitions: Partitions) -> Self {
        Self {
            core,
            partitions,
            import: true,
        }
    }
}

impl ChannelTask for WriteTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let data = self.partitions.channel(channel.index());
        channel.write(self.core.timestamp(), data, self.import)
    }

    fn succeed(&self, channel: &mut Channel) -> CoreResult<()> {
        channel.commit_write(self.partitions.channel(channel.index()))
    }

    fn fail(&self, channel: &mut Channel) -> CoreResult<()> {
        channel.rollback_write()
    }

    fn clean_up(&self, channel: &mut Channel) {
        channel.finish_write();
    }
}

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoadRequest {
    ObjectIds(Vec<ObjectId>),
    TypeIds(Vec<TypeId>),
    Roots,
}

/// Records returned by a load.
#[derive(Debug, Clone, Default)]
pub struct LoadedData {
    /// Concatenated entity records, at most one chunk per channel.
    pub chunks: Vec<Bytes>,
    /// Requested object IDs without entity.
    pub missing: Vec<ObjectId>,
    /// For root loads, the newest root entity; null otherwise.
    pub root_object_id: ObjectId,
}

impl LoadedData {
    /// Total length of the returned records.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.len() as u64).sum()
    }
}

#[derive(Debug)]
pub(crate) struct LoadTask {
    core: TaskCore,
    request: LoadRequest,
    results: Slots<(ChannelLoad, ObjectId)>,
}

impl LoadTask {
    pub(crate) fn new(core: TaskCore, channel_count: usize, request: LoadRequest) -> Self {
        Self {
            core,
            request,
            results: Slots::new(channel_count),
        }
    }

    pub(crate) fn loaded(&self) -> LoadedData {
        let mut loaded = LoadedData::default();
        for (load, root) in self.results.take_all() {
            if !load.data.is_empty() {
                loaded.chunks.push(load.data);
            }
            loaded.missing.extend(load.missing);
            loaded.root_object_id = loaded.root_object_id.max(root);
        }
        loaded.missing.sort_unstable();
        loaded
    }
}

impl ChannelTask for LoadTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let result = match &self.request {
            LoadRequest::ObjectIds(ids) => (channel.load_object_ids(ids)?, ObjectId::NULL),
            LoadRequest::TypeIds(ids) => (
                ChannelLoad {
                    data: channel.load_type_ids(ids)?,
                    missing: Vec::new(),
                },
                ObjectId::NULL,
            ),
            LoadRequest::Roots => {
                let (data, root) = channel.load_roots()?;
                (
                    ChannelLoad {
                        data,
                        missing: Vec::new(),
                    },
                    root,
                )
            }
        };
        self.results.put(channel.index(), result);
        Ok(())
    }
}

/// Maintenance run on request with a time budget.
#[derive(Debug, Clone)]
pub(crate) enum Maintenance {
    GarbageCollection,
    FileCheck,
    CacheCheck(Option<Arc<dyn EntityCacheEvaluator>>),
}

#[derive(Debug)]
pub(crate) struct MaintenanceTask {
    core: TaskCore,
    kind: Maintenance,
    deadline: Option<Instant>,
    completed: Slots<bool>,
    channel_count: usize,
}

impl MaintenanceTask {
    pub(crate) fn new(core: TaskCore, channel_count: usize, kind: Maintenance, deadline: Option<Instant>) -> Self {
        Self {
            core,
            kind,
            deadline,
            completed: Slots::new(channel_count),
            channel_count,
        }
    }

    /// Returns true if every channel completed its work.
    pub(crate) fn completed(&self) -> bool {
        let completed = self.completed.take_all();
        completed.len() == self.channel_count && completed.into_iter().all(|done| done)
    }
}

impl ChannelTask for MaintenanceTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let completed = match &self.kind {
            Maintenance::GarbageCollection => channel.collect_garbage(self.deadline, self.core.controller())?,
            Maintenance::FileCheck => channel.check_files(self.deadline)?,
            Maintenance::CacheCheck(evaluator) => channel.check_cache(evaluator.as_deref(), self.deadline),
        };
        self.completed.put(channel.index(), completed);
        Ok(())
    }
}

/// Copies every channel's files into another storage directory.
#[derive(Debug)]
pub(crate) struct ExportChannelsTask {
    core: TaskCore,
    target: StorageLayout,
}

impl ExportChannelsTask {
    pub(crate) fn new(core: TaskCore, target: StorageLayout) -> Self {
        Self { core, target }
    }
}

impl ChannelTask for ExportChannelsTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        channel.export_to(&self.target)
    }
}

/// One type's export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedType {
    /// Exported type.
    pub type_id: TypeId,
    /// Type name from the dictionary.
    pub type_name: String,
    /// The written file.
    pub path: PathBuf,
    /// Number of exported entities.
    pub entity_count: u64,
    /// Number of written bytes.
    pub byte_count: u64,
}

/// Appends the records of selected types to one file per type. Channels
/// take turns on the shared file table, so each channel's records of a
/// type stay together.
#[derive(Debug)]
pub(crate) struct ExportTypesTask {
    core: TaskCore,
    directory: PathBuf,
    filter: Option<BTreeSet<TypeId>>,
    exported: Mutex<BTreeMap<TypeId, ExportedType>>,
}

impl ExportTypesTask {
    pub(crate) fn new(core: TaskCore, directory: PathBuf, filter: Option<BTreeSet<TypeId>>) -> Self {
        Self {
            core,
            directory,
            filter,
            exported: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn exported(&self) -> Vec<ExportedType> {
        self.exported.lock().values().cloned().collect()
    }
}

impl ChannelTask for ExportTypesTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let fs = Arc::clone(channel.file_system());
        for type_id in channel.type_ids() {
            if self.filter.as_ref().map_or(false, |filter| !filter.contains(&type_id)) {
                continue;
            }
            let (count, data) = channel.type_records(type_id)?;
            let name = channel.type_name(type_id).unwrap_or_default();

            let mut exported = self.exported.lock();
            if !exported.contains_key(&type_id) {
                let path = self.directory.join(format!("{name}_{}.dat", type_id.0));
                if fs.exists(&path) {
                    fs.delete(&path)?;
                }
                exported.insert(
                    type_id,
                    ExportedType {
                        type_id,
                        type_name: name,
                        path,
                        entity_count: 0,
                        byte_count: 0,
                    },
                );
            }
            let Some(entry) = exported.get_mut(&type_id) else {
                continue;
            };
            let mut file = fs.open(&entry.path)?;
            file.append(&data)?;
            file.sync()?;
            entry.entity_count += count;
            entry.byte_count += data.len() as u64;
            debug!(channel = channel.index(), type_id = %type_id, entities = count, "type exported");
        }
        Ok(())
    }
}

/// Collects per-file statistics of every channel.
#[derive(Debug)]
pub(crate) struct StatisticsTask {
    core: TaskCore,
    results: Slots<ChannelStatistics>,
}

impl StatisticsTask {
    pub(crate) fn new(core: TaskCore, channel_count: usize) -> Self {
        Self {
            core,
            results: Slots::new(channel_count),
        }
    }

    pub(crate) fn channels(&self) -> Vec<ChannelStatistics> {
        self.results.take_all()
    }
}

impl ChannelTask for StatisticsTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        let statistics = channel.statistics()?;
        self.results.put(channel.index(), statistics);
        Ok(())
    }
}

/// Flushes every file and stops the channel threads.
#[derive(Debug)]
pub(crate) struct ShutdownTask {
    core: TaskCore,
}

impl ShutdownTask {
    pub(crate) fn new(core: TaskCore) -> Self {
        Self { core }
    }
}

impl ChannelTask for ShutdownTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn process_by(&self, channel: &mut Channel) -> CoreResult<()> {
        channel.close()
    }

    fn stops_channel(&self) -> bool {
        true
    }
}
