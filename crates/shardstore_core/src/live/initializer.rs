//! Channel startup.
//!
//! Startup runs in two steps with a barrier in between. First every channel
//! replays its transactions log ([`analyze_channel`]). From all analyses
//! the consistent store timestamp is derived: the newest store every
//! channel has logged. Then every channel repairs its files to exactly the
//! state of that store and registers the entities it finds
//! ([`initialize_channel`]).

use super::data_file::LiveDataFile;
use super::manager::FileManager;
use super::FileContext;
use crate::binary::{RecordIter, RecordKind};
use crate::cache::EntityCache;
use crate::error::{CoreError, CoreResult};
use crate::files::{ChannelInventory, FileIdentity, StoredFile};
use crate::transactions::entry::encode_all;
use crate::transactions::{TransactionEntry, TransactionsAnalysis, TransactionsLog};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// What a channel found on disk before repairing anything.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelAnalysis {
    pub(crate) inventory: ChannelInventory,
    /// Replay of the log; `None` if the log is missing or empty.
    pub(crate) transactions: Option<TransactionsAnalysis>,
}

/// Lists a channel's files and replays its transactions log.
pub(crate) fn analyze_channel(ctx: &FileContext) -> CoreResult<ChannelAnalysis> {
    let inventory = ctx.layout.inventory(ctx.fs.as_ref(), ctx.channel)?;
    let transactions = match inventory.transactions_size {
        Some(size) if size > 0 => {
            let path = ctx.layout.path(FileIdentity::transactions(ctx.channel));
            Some(TransactionsAnalysis::analyze(&ctx.fs.read_all(&path)?)?)
        }
        _ => None,
    };
    debug!(
        channel = ctx.channel,
        data_files = inventory.data_files.len(),
        logged = transactions.is_some(),
        "channel analyzed"
    );
    Ok(ChannelAnalysis {
        inventory,
        transactions,
    })
}

/// The newest store timestamp logged by every channel with a log.
pub(crate) fn consistent_timestamp(analyses: &[ChannelAnalysis]) -> i64 {
    analyses
        .iter()
        .filter_map(|analysis| analysis.transactions.as_ref())
        .map(TransactionsAnalysis::head_latest_timestamp)
        .min()
        .unwrap_or(0)
}

/// The highest timestamp in any log; new timestamps must be above it.
pub(crate) fn max_logged_timestamp(analyses: &[ChannelAnalysis]) -> i64 {
    analyses
        .iter()
        .filter_map(|analysis| analysis.transactions.as_ref())
        .map(TransactionsAnalysis::max_timestamp)
        .max()
        .unwrap_or(0)
}

/// Log entries describing the data files as they are, for a channel whose
/// log is lost.
fn derive_entries(inventory: &ChannelInventory, consistent_timestamp: i64, timestamp: i64) -> Vec<TransactionEntry> {
    let mut entries: Vec<_> = inventory
        .data_files
        .iter()
        .map(|(number, size)| TransactionEntry::FileCreation {
            timestamp,
            file_length: *size,
            file_number: *number,
        })
        .collect();
    if let (Some((_, head_size)), true) = (inventory.data_files.iter().next_back(), consistent_timestamp > 0) {
        entries.push(TransactionEntry::Store {
            timestamp: consistent_timestamp,
            file_length: *head_size,
        });
    }
    entries
}

/// Repairs a channel's files to the consistent store and registers its
/// entities in `cache`.
///
/// # Errors
///
/// Returns a consistency error if the files contradict the log in a way
/// that cannot be repaired by cutting off uncommitted data, or if a record
/// is garbled, belongs to another channel or has an unknown type.
pub(crate) fn initialize_channel(
    ctx: FileContext,
    analysis: ChannelAnalysis,
    consistent_timestamp: i64,
    timestamp: i64,
    cache: &mut EntityCache,
) -> CoreResult<FileManager> {
    let channel = ctx.channel;
    let fs = Arc::clone(&ctx.fs);
    let log_file = Arc::new(StoredFile::open(fs.as_ref(), &ctx.layout, FileIdentity::transactions(channel))?);
    let mut log = TransactionsLog::new(Arc::clone(&log_file), Arc::clone(&ctx.writer), log_file.size()?);

    let (logged, head_length) = match analysis.transactions {
        Some(logged) => {
            log.truncate_to(logged.consumed_length())?;
            let head_length = logged.consistent_head_length(consistent_timestamp)?;
            (logged, head_length)
        }
        None => {
            let entries = derive_entries(&analysis.inventory, consistent_timestamp, timestamp);
            log.rewrite(&encode_all(&entries))?;
            info!(channel, files = analysis.inventory.data_files.len(), "transactions log derived from data files");
            let logged = TransactionsAnalysis::from_entries(&entries)?;
            let head_length = logged.head_latest_length();
            (logged, head_length)
        }
    };

    let head = logged.head_file_number();
    let mut files = BTreeMap::new();
    let mut head_truncation = None;
    for logged_file in logged.files().values() {
        let number = logged_file.number;
        let present = analysis.inventory.data_files.get(&number).copied();
        let identity = FileIdentity::data(channel, number);
        if logged_file.deleted {
            if present.is_some() {
                let file = Arc::new(StoredFile::open(fs.as_ref(), &ctx.layout, identity)?);
                ctx.writer.delete(&file)?;
                debug!(channel, file = number, "removed file logged as deleted");
            }
            continue;
        }

        let expected = if Some(number) == head { head_length } else { logged_file.length };
        let size = match present {
            Some(size) => size,
            None if expected == 0 => 0,
            None => {
                return Err(CoreError::consistency(format!(
                    "data file {number} of channel {channel} with {expected} logged bytes is missing"
                )))
            }
        };
        if size < expected || (size > expected && Some(number) != head) {
            return Err(CoreError::consistency(format!(
                "data file {number} of channel {channel} has {size} bytes, the log expects {expected}"
            )));
        }
        if size > expected {
            head_truncation = Some((number, expected));
        }
        let file = Arc::new(StoredFile::open(fs.as_ref(), &ctx.layout, identity)?);
        files.insert(number, LiveDataFile::new(number, file, size));
    }

    for (&number, &size) in &analysis.inventory.data_files {
        if logged.files().contains_key(&number) {
            continue;
        }
        if size > 0 {
            return Err(CoreError::consistency(format!(
                "data file {number} of channel {channel} holds {size} bytes but is not logged"
            )));
        }
        let file = Arc::new(StoredFile::open(fs.as_ref(), &ctx.layout, FileIdentity::data(channel, number))?);
        ctx.writer.delete(&file)?;
        debug!(channel, file = number, "removed empty unlogged file");
    }

    let max_file_number = analysis
        .inventory
        .data_files
        .keys()
        .next_back()
        .copied()
        .unwrap_or(0)
        .max(logged.max_file_number());
    let channel_count = ctx.channel_count;
    let mut manager = FileManager::new(ctx, files, log, max_file_number);
    if let Some((number, length)) = head_truncation {
        manager.truncate_file(number, length)?;
    }

    let numbers: Vec<u64> = manager.file_numbers().collect();
    for number in numbers.into_iter().rev() {
        let content = manager.read_committed(number)?;
        let live = register_file(cache, channel, channel_count, number, &content)?;
        manager.add_live_content(number, live);
    }

    if manager.file_count() == 0 {
        manager.create_head_file(timestamp)?;
    } else {
        manager.ensure_head_capacity(timestamp, 0)?;
    }
    info!(
        channel,
        files = manager.file_count(),
        entities = cache.entity_count(),
        "channel initialized"
    );
    Ok(manager)
}

/// Registers the entities of one data file that no newer record
/// supersedes. Returns their total length.
fn register_file(
    cache: &mut EntityCache,
    channel: usize,
    channel_count: usize,
    number: u64,
    content: &[u8],
) -> CoreResult<u64> {
    let mut records = Vec::new();
    for record in RecordIter::new(content, 0) {
        let record = record.map_err(|e| CoreError::consistency(format!("data file {number} of channel {channel}: {e}")))?;
        if let RecordKind::Entity(header) = record.kind {
            if header.object_id.channel(channel_count) != channel {
                return Err(CoreError::consistency(format!(
                    "{} in data file {number} does not belong to channel {channel}",
                    header.object_id
                )));
            }
            records.push((record.offset, header));
        }
    }

    let mut seen = HashSet::new();
    let winners: Vec<_> = records
        .iter()
        .rev()
        .filter(|(_, header)| !cache.contains(header.object_id) && seen.insert(header.object_id))
        .collect();

    let mut live = 0;
    for (offset, header) in winners.into_iter().rev() {
        cache.register_initial(header, number, *offset)?;
        live += header.length;
    }
    Ok(live)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::binary::encode_entity;
    use crate::config::{FileNaming, GcConfig};
    use crate::dictionary::{SimpleTypeDictionary, TypeLayout};
    use crate::files::StorageLayout;
    use crate::gc::evaluator::DefaultCacheEvaluator;
    use crate::gc::monitor::MarkMonitor;
    use crate::live::evaluator::DataFileEvaluator;
    use crate::stats::StorageStats;
    use crate::transactions::EntryIter;
    use crate::types::{ObjectId, TypeId};
    use crate::writer::DefaultWriter;
    use shardstore_storage::{FileSystem, InMemoryFileSystem};

    pub(crate) const LEAF: TypeId = TypeId(2);

    pub(crate) struct Harness {
        pub(crate) fs: Arc<InMemoryFileSystem>,
        pub(crate) evaluator: DataFileEvaluator,
        pub(crate) stats: Arc<StorageStats>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_evaluator(DataFileEvaluator::default())
        }

        pub(crate) fn with_evaluator(evaluator: DataFileEvaluator) -> Self {
            Self {
                fs: Arc::new(InMemoryFileSystem::new()),
                evaluator,
                stats: Arc::new(StorageStats::new()),
            }
        }

        pub(crate) fn layout(&self) -> StorageLayout {
            StorageLayout::new("/store", FileNaming::default())
        }

        pub(crate) fn context(&self) -> FileContext {
            let fs: Arc<dyn FileSystem> = self.fs.clone();
            FileContext {
                channel: 0,
                channel_count: 1,
                writer: Arc::new(DefaultWriter::new(Arc::clone(&fs), None, None)),
                fs,
                layout: self.layout(),
                evaluator: self.evaluator,
                stats: Arc::clone(&self.stats),
            }
        }

        pub(crate) fn cache(&self) -> EntityCache {
            let dictionary = SimpleTypeDictionary::new();
            dictionary.register(TypeLayout::new(LEAF, "Leaf")).unwrap();
            EntityCache::new(
                0,
                Arc::new(dictionary),
                Arc::new(DefaultCacheEvaluator::default()),
                Arc::new(MarkMonitor::new(1, 16)),
                &GcConfig::default(),
                Arc::clone(&self.stats),
            )
        }

        pub(crate) fn start(&self, timestamp: i64) -> CoreResult<(FileManager, EntityCache)> {
            let ctx = self.context();
            let analysis = analyze_channel(&ctx)?;
            let consistent = consistent_timestamp(std::slice::from_ref(&analysis));
            let mut cache = self.cache();
            let manager = initialize_channel(ctx, analysis, consistent, timestamp, &mut cache)?;
            Ok((manager, cache))
        }

        pub(crate) fn data_path(&self, number: u64) -> std::path::PathBuf {
            self.layout().path(FileIdentity::data(0, number))
        }

        pub(crate) fn log_entries(&self) -> Vec<TransactionEntry> {
            let bytes = self
                .fs
                .read_all(&self.layout().path(FileIdentity::transactions(0)))
                .unwrap();
            EntryIter::new(&bytes).map(|entry| entry.unwrap().1).collect()
        }
    }

    pub(crate) fn records(ids: impl IntoIterator<Item = u64>, content: &[u8]) -> Vec<u8> {
        ids.into_iter()
            .flat_map(|id| encode_entity(LEAF, ObjectId(id), content))
            .collect()
    }

    /// Stores and commits like a store task would.
    pub(crate) fn store(manager: &mut FileManager, cache: &mut EntityCache, timestamp: i64, data: &[u8]) {
        let chunk = manager.write_store(timestamp, data).unwrap();
        manager.commit_write(&chunk);
        for record in RecordIter::new(data, chunk.position) {
            let record = record.unwrap();
            if let RecordKind::Entity(header) = record.kind {
                let start = (record.offset - chunk.position) as usize;
                let bytes = bytes::Bytes::copy_from_slice(&data[start..start + header.length as usize]);
                cache
                    .register_stored(&header, chunk.file_number, record.offset, bytes, manager)
                    .unwrap();
            }
        }
    }

    #[test]
    fn fresh_channel_starts_with_file_one() {
        let harness = Harness::new();
        let (manager, cache) = harness.start(7).unwrap();
        assert_eq!(manager.head_number().unwrap(), 1);
        assert_eq!(cache.entity_count(), 0);
        assert_eq!(
            harness.log_entries(),
            vec![TransactionEntry::FileCreation {
                timestamp: 7,
                file_length: 0,
                file_number: 1,
            }]
        );
    }

    #[test]
    fn restart_registers_newest_versions() {
        let harness = Harness::new();
        {
            let (mut manager, mut cache) = harness.start(1).unwrap();
            store(&mut manager, &mut cache, 10, &records([1, 2], b"old"));
            manager.create_head_file(11).unwrap();
            store(&mut manager, &mut cache, 12, &records([2], b"new!"));
            store(&mut manager, &mut cache, 13, &records([3, 3], b"x"));
        }

        let (manager, mut cache) = harness.start(20).unwrap();
        assert_eq!(cache.entity_count(), 3);
        let key = cache.lookup(ObjectId(2)).unwrap();
        let record = cache.load(key, &manager).unwrap();
        assert_eq!(&record[24..], b"new!");

        let statistics = manager.statistics(&cache);
        assert_eq!(statistics.files[0].live_data_length, 27);
        assert_eq!(statistics.files[0].file_length, 54);
        assert_eq!(statistics.files[1].live_data_length, 28 + 25);
        assert_eq!(statistics.files[1].entity_count, 2);
    }

    #[test]
    fn uncommitted_head_tail_is_truncated() {
        let harness = Harness::new();
        {
            let (mut manager, mut cache) = harness.start(1).unwrap();
            // 100 records of 50 bytes
            store(&mut manager, &mut cache, 10, &records(1..=100, &[7; 26]));
        }
        let mut head = harness.fs.open(&harness.data_path(1)).unwrap();
        head.append(&[0xAB; 200]).unwrap();
        assert_eq!(harness.fs.file_size(&harness.data_path(1)).unwrap(), 5200);

        let (manager, cache) = harness.start(20).unwrap();
        assert_eq!(harness.fs.file_size(&harness.data_path(1)).unwrap(), 5000);
        assert_eq!(cache.entity_count(), 100);
        assert_eq!(manager.statistics(&cache).files[0].live_data_length, 5000);
        assert!(matches!(
            harness.log_entries().last(),
            Some(TransactionEntry::FileTruncation {
                file_length: 5000,
                old_length: 5200,
                ..
            })
        ));
        assert_eq!(harness.stats.snapshot().files_truncated, 1);
    }

    #[test]
    fn non_head_length_mismatch_is_fatal() {
        let harness = Harness::new();
        {
            let (mut manager, mut cache) = harness.start(1).unwrap();
            store(&mut manager, &mut cache, 10, &records([1], b"a"));
            manager.create_head_file(11).unwrap();
        }
        let mut first = harness.fs.open(&harness.data_path(1)).unwrap();
        first.append(&[0; 16]).unwrap();
        assert!(harness.start(20).unwrap_err().is_consistency());
    }

    #[test]
    fn unlogged_files() {
        let harness = Harness::new();
        drop(harness.start(1).unwrap());
        harness.fs.open(&harness.data_path(5)).unwrap();
        let (manager, _) = harness.start(2).unwrap();
        assert!(!harness.fs.exists(&harness.data_path(5)));
        assert_eq!(manager.head_number().unwrap(), 1);

        let mut stray = harness.fs.open(&harness.data_path(6)).unwrap();
        stray.append(&records([1], b"")).unwrap();
        assert!(harness.start(3).unwrap_err().is_consistency());
    }

    #[test]
    fn lost_log_is_derived_from_files() {
        let harness = Harness::new();
        {
            let (mut manager, mut cache) = harness.start(1).unwrap();
            store(&mut manager, &mut cache, 10, &records([1, 2], b"ab"));
        }
        harness
            .fs
            .delete(&harness.layout().path(FileIdentity::transactions(0)))
            .unwrap();

        let (_, cache) = harness.start(5).unwrap();
        assert_eq!(cache.entity_count(), 2);
        assert_eq!(
            harness.log_entries(),
            vec![TransactionEntry::FileCreation {
                timestamp: 5,
                file_length: 52,
                file_number: 1,
            }]
        );
    }

    #[test]
    fn consistent_timestamp_is_the_oldest_latest_store() {
        let logged = |entries: &[TransactionEntry]| ChannelAnalysis {
            inventory: ChannelInventory::default(),
            transactions: Some(TransactionsAnalysis::from_entries(entries).unwrap()),
        };
        let creation = TransactionEntry::FileCreation {
            timestamp: 1,
            file_length: 0,
            file_number: 1,
        };
        let store = |timestamp| TransactionEntry::Store {
            timestamp,
            file_length: 0,
        };
        let analyses = vec![
            logged(&[creation, store(10), store(20)]),
            logged(&[creation, store(10)]),
            ChannelAnalysis::default(),
        ];
        assert_eq!(consistent_timestamp(&analyses), 10);
        assert_eq!(max_logged_timestamp(&analyses), 20);
        assert_eq!(consistent_timestamp(&[]), 0);
    }

    #[test]
    fn foreign_records_are_fatal() {
        let harness = Harness::new();
        {
            let (mut manager, mut cache) = harness.start(1).unwrap();
            store(&mut manager, &mut cache, 10, &records([1], b""));
        }
        // with two channels object 1 belongs to channel 1
        let ctx = FileContext {
            channel_count: 2,
            ..harness.context()
        };
        let analysis = analyze_channel(&ctx).unwrap();
        let mut cache = harness.cache();
        let error = initialize_channel(ctx, analysis, 10, 30, &mut cache).unwrap_err();
        assert!(error.is_consistency());
    }
}
