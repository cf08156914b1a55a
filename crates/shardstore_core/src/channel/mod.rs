//! Channel workers.
//!
//! A channel owns the entities whose object ID hashes to it, their cache
//! and the data files holding them. Its thread takes tasks from the
//! [`TaskBroker`](crate::task::TaskBroker) and runs housekeeping in
//! between. Nothing but the channel thread touches a channel's state.

mod housekeeping;

use crate::binary::{RecordIter, RecordKind};
use crate::cache::EntityCache;
use crate::config::HousekeepingConfig;
use crate::controller::OperationController;
use crate::error::{CoreError, CoreResult};
use crate::files::StorageLayout;
use crate::gc::evaluator::EntityCacheEvaluator;
use crate::gc::monitor::MarkMonitor;
use crate::live::initializer::{self, ChannelAnalysis};
use crate::live::manager::{FileManager, WrittenChunk};
use crate::live::FileContext;
use crate::stats::ChannelStatistics;
use crate::task::{self, TaskBroker};
use crate::types::{ObjectId, TypeId};
use bytes::{Bytes, BytesMut};
use shardstore_storage::FileSystem;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// What a channel learned about its entities at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAnalysis {
    /// Highest object ID in use.
    pub highest_object_id: ObjectId,
    /// Every type with at least one entity.
    pub type_ids: BTreeSet<TypeId>,
}

impl IdAnalysis {
    /// Combines the analyses of several channels.
    pub(crate) fn merge(&mut self, other: Self) {
        self.highest_object_id = self.highest_object_id.max(other.highest_object_id);
        self.type_ids.extend(other.type_ids);
    }
}

/// Records found for a load request in one channel.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelLoad {
    pub(crate) data: Bytes,
    pub(crate) missing: Vec<ObjectId>,
}

/// One channel's cache, files and housekeeping schedule.
#[derive(Debug)]
pub(crate) struct Channel {
    index: usize,
    channel_count: usize,
    ctx: FileContext,
    cache: EntityCache,
    files: Option<FileManager>,
    analysis: Option<ChannelAnalysis>,
    pending_chunk: Option<WrittenChunk>,
    monitor: Arc<MarkMonitor>,
    housekeeping: HousekeepingConfig,
    last_housekeeping: Instant,
}

impl Channel {
    pub(crate) fn new(
        ctx: FileContext,
        cache: EntityCache,
        monitor: Arc<MarkMonitor>,
        housekeeping: HousekeepingConfig,
    ) -> Self {
        Self {
            index: ctx.channel,
            channel_count: ctx.channel_count,
            ctx,
            cache,
            files: None,
            analysis: None,
            pending_chunk: None,
            monitor,
            housekeeping,
            last_housekeeping: Instant::now(),
        }
    }

    pub(crate) const fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.ctx.fs
    }

    fn parts(&mut self) -> CoreResult<(&mut EntityCache, &mut FileManager)> {
        match self.files.as_mut() {
            Some(files) => Ok((&mut self.cache, files)),
            None => Err(CoreError::consistency(format!(
                "channel {} is not initialized",
                self.index
            ))),
        }
    }

    /// Replays the transactions log and keeps the result for
    /// [`Channel::initialize`].
    pub(crate) fn analyze(&mut self) -> CoreResult<ChannelAnalysis> {
        let analysis = initializer::analyze_channel(&self.ctx)?;
        self.analysis = Some(analysis.clone());
        Ok(analysis)
    }

    /// Repairs the files to the consistent store and registers the
    /// entities found.
    pub(crate) fn initialize(&mut self, consistent_timestamp: i64, timestamp: i64) -> CoreResult<IdAnalysis> {
        let analysis = self.analysis.take().ok_or_else(|| {
            CoreError::consistency(format!("channel {} initialized before analysis", self.index))
        })?;
        let files = initializer::initialize_channel(
            self.ctx.clone(),
            analysis,
            consistent_timestamp,
            timestamp,
            &mut self.cache,
        )?;
        self.files = Some(files);
        Ok(IdAnalysis {
            highest_object_id: self.cache.highest_object_id(),
            type_ids: self.cache.type_ids().collect(),
        })
    }

    /// Writes this channel's part of a store or import.
    pub(crate) fn write(&mut self, timestamp: i64, data: &[u8], import: bool) -> CoreResult<()> {
        self.monitor.register_pending_store_update(self.index);
        self.monitor.reset_completion();
        let (_, files) = self.parts()?;
        let chunk = if import {
            files.write_import(timestamp, data)?
        } else {
            files.write_store(timestamp, data)?
        };
        self.pending_chunk = Some(chunk);
        Ok(())
    }

    /// Registers the entities of the written part and commits it.
    pub(crate) fn commit_write(&mut self, data: &[u8]) -> CoreResult<()> {
        let Some(chunk) = self.pending_chunk.take() else {
            return Ok(());
        };
        let (cache, files) = self.parts()?;
        for record in RecordIter::new(data, chunk.position) {
            let record = record?;
            if let RecordKind::Entity(header) = record.kind {
                let start = (record.offset - chunk.position) as usize;
                let bytes = Bytes::copy_from_slice(&data[start..start + header.length as usize]);
                cache.register_stored(&header, chunk.file_number, record.offset, bytes, files)?;
            }
        }
        files.commit_write(&chunk);
        Ok(())
    }

    /// Undoes the written part, if anything was written.
    pub(crate) fn rollback_write(&mut self) -> CoreResult<()> {
        self.pending_chunk = None;
        match self.files.as_mut() {
            Some(files) => files.rollback_write(),
            None => Ok(()),
        }
    }

    pub(crate) fn finish_write(&mut self) {
        self.monitor.clear_pending_store_update(self.index);
    }

    fn owns(&self, object_id: ObjectId) -> bool {
        !object_id.is_null() && object_id.channel(self.channel_count) == self.index
    }

    /// Loads the records of the requested IDs this channel owns.
    pub(crate) fn load_object_ids(&mut self, object_ids: &[ObjectId]) -> CoreResult<ChannelLoad> {
        let owned: Vec<ObjectId> = object_ids.iter().copied().filter(|id| self.owns(*id)).collect();
        let (cache, files) = self.parts()?;
        let mut data = BytesMut::new();
        let mut missing = Vec::new();
        for object_id in owned {
            match cache.lookup(object_id) {
                Some(key) => data.extend_from_slice(&cache.load(key, files)?),
                None => missing.push(object_id),
            }
        }
        Ok(ChannelLoad {
            data: data.freeze(),
            missing,
        })
    }

    /// Loads every record of the given types.
    pub(crate) fn load_type_ids(&mut self, type_ids: &[TypeId]) -> CoreResult<Bytes> {
        let (cache, files) = self.parts()?;
        let mut data = BytesMut::new();
        for type_id in type_ids {
            for key in cache.keys_of_type(*type_id) {
                data.extend_from_slice(&cache.load(key, files)?);
            }
        }
        Ok(data.freeze())
    }

    /// Loads the root entities and returns them with the channel's root ID.
    pub(crate) fn load_roots(&mut self) -> CoreResult<(Bytes, ObjectId)> {
        let root = self.cache.root_object_id();
        if root.is_null() {
            return Ok((Bytes::new(), root));
        }
        let (cache, files) = self.parts()?;
        let record = match cache.lookup(root) {
            Some(key) => cache.load(key, files)?,
            None => Bytes::new(),
        };
        Ok((record, root))
    }

    /// Concatenated records of one type, read without caching them.
    pub(crate) fn type_records(&mut self, type_id: TypeId) -> CoreResult<(u64, Vec<u8>)> {
        let (cache, files) = self.parts()?;
        let keys = cache.keys_of_type(type_id);
        let mut data = Vec::new();
        for key in &keys {
            data.extend_from_slice(&cache.peek(*key, files)?);
        }
        Ok((keys.len() as u64, data))
    }

    pub(crate) fn type_ids(&self) -> Vec<TypeId> {
        self.cache.type_ids().collect()
    }

    pub(crate) fn type_name(&self, type_id: TypeId) -> Option<String> {
        self.cache.type_name(type_id)
    }

    /// Collects garbage, waiting for marks of other channels while
    /// `controller` runs.
    pub(crate) fn collect_garbage(
        &mut self,
        deadline: Option<Instant>,
        controller: &OperationController,
    ) -> CoreResult<bool> {
        let (cache, files) = self.parts()?;
        cache.incremental_gc(files, deadline, Some(controller))
    }

    pub(crate) fn check_files(&mut self, deadline: Option<Instant>) -> CoreResult<bool> {
        let (cache, files) = self.parts()?;
        files.incremental_cleanup(cache, deadline)
    }

    pub(crate) fn check_cache(
        &mut self,
        evaluator: Option<&dyn EntityCacheEvaluator>,
        deadline: Option<Instant>,
    ) -> bool {
        self.cache.incremental_cache_check(evaluator, deadline)
    }

    pub(crate) fn export_to(&mut self, target: &StorageLayout) -> CoreResult<()> {
        let (_, files) = self.parts()?;
        files.export_to(target)
    }

    pub(crate) fn statistics(&mut self) -> CoreResult<ChannelStatistics> {
        let (cache, files) = self.parts()?;
        Ok(files.statistics(cache))
    }

    /// Flushes every file before the channel stops.
    pub(crate) fn close(&mut self) -> CoreResult<()> {
        match self.files.as_ref() {
            Some(files) => files.sync_all(),
            None => Ok(()),
        }
    }

    /// Processes tasks and housekeeping until a task stops the channel or
    /// the storage stops running.
    pub(crate) fn run(mut self, broker: &TaskBroker, controller: &OperationController) {
        info!(channel = self.index, "channel started");
        while controller.is_running() {
            if let Some(task) = broker.next_task(self.index, self.housekeeping.interval) {
                if task::execute(task.as_ref(), &mut self).is_some() {
                    break;
                }
                if task.stops_channel() {
                    break;
                }
            }
            if let Err(problem) = self.run_housekeeping() {
                controller.register_disruption(Arc::new(problem));
                break;
            }
        }
        debug!(channel = self.index, entities = self.cache.entity_count(), "channel stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::binary::encode_entity;
    use crate::config::HousekeepingConfig;
    use crate::live::initializer::tests::{Harness, LEAF};
    use shardstore_storage::FileSystem;
    use std::time::Duration;

    pub(crate) fn channel(interval: Duration) -> (Channel, Harness) {
        let harness = Harness::new();
        let cache = harness.cache();
        let monitor = Arc::clone(cache.monitor());
        let housekeeping = HousekeepingConfig {
            interval,
            time_budget: Duration::from_millis(50),
        };
        (Channel::new(harness.context(), cache, monitor, housekeeping), harness)
    }

    fn started() -> (Channel, Harness) {
        let (mut channel, harness) = channel(Duration::from_secs(3600));
        channel.analyze().unwrap();
        channel.initialize(0, 1).unwrap();
        (channel, harness)
    }

    fn stored(channel: &mut Channel, timestamp: i64, data: &[u8]) {
        channel.write(timestamp, data, false).unwrap();
        channel.commit_write(data).unwrap();
        channel.finish_write();
    }

    #[test]
    fn operations_need_initialization() {
        let (mut channel, _) = channel(Duration::from_secs(1));
        assert!(channel.write(1, &[], false).unwrap_err().is_consistency());
        assert!(channel.initialize(0, 1).unwrap_err().is_consistency());
        assert!(channel.close().is_ok());
    }

    #[test]
    fn committed_entities_can_be_loaded() {
        let (mut channel, _) = started();
        let mut data = encode_entity(LEAF, ObjectId(1), b"one");
        data.extend(encode_entity(LEAF, ObjectId(2), b"two"));
        stored(&mut channel, 5, &data);

        let load = channel
            .load_object_ids(&[ObjectId(2), ObjectId(9), ObjectId::NULL])
            .unwrap();
        assert_eq!(load.data.as_ref(), encode_entity(LEAF, ObjectId(2), b"two").as_slice());
        assert_eq!(load.missing, vec![ObjectId(9)]);

        assert_eq!(channel.load_type_ids(&[LEAF]).unwrap().as_ref(), data.as_slice());
        let (count, records) = channel.type_records(LEAF).unwrap();
        assert_eq!(count, 2);
        assert_eq!(records, data);
        assert_eq!(channel.type_ids(), vec![LEAF]);
        assert_eq!(channel.type_name(LEAF).as_deref(), Some("Leaf"));
    }

    #[test]
    fn rolled_back_writes_leave_no_entities() {
        let (mut channel, harness) = started();
        let data = encode_entity(LEAF, ObjectId(1), b"gone");
        channel.write(5, &data, false).unwrap();
        channel.rollback_write().unwrap();
        channel.finish_write();

        assert!(!channel.cache.contains(ObjectId(1)));
        assert_eq!(harness.fs.file_size(&harness.data_path(1)).unwrap(), 0);
        assert!(channel.load_object_ids(&[ObjectId(1)]).unwrap().data.is_empty());
        assert!(!channel.monitor.status().hot_complete);
    }

    #[test]
    fn restart_reports_id_analysis() {
        let (mut channel, harness) = started();
        stored(&mut channel, 5, &encode_entity(LEAF, ObjectId(41), b"x"));
        channel.close().unwrap();
        drop(channel);

        let cache = harness.cache();
        let monitor = Arc::clone(cache.monitor());
        let mut channel = Channel::new(harness.context(), cache, monitor, HousekeepingConfig::default());
        let analysis = channel.analyze().unwrap();
        let consistent = initializer::consistent_timestamp(&[analysis]);
        let ids = channel.initialize(consistent, 10).unwrap();
        assert_eq!(ids.highest_object_id, ObjectId(41));
        assert_eq!(ids.type_ids, BTreeSet::from([LEAF]));
    }
}
