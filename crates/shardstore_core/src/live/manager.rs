//! The data files and transactions log of one channel.

use super::data_file::LiveDataFile;
use super::FileContext;
use crate::cache::{DataFileAccess, EntityCache};
use crate::error::{CoreError, CoreResult};
use crate::files::{FileIdentity, FileUser, StorageLayout, StoredFile};
use crate::stats::ChannelStatistics;
use crate::transactions::cleaner;
use crate::transactions::entry::encode_all;
use crate::transactions::{TransactionEntry, TransactionsAnalysis, TransactionsLog};
use crate::types::now_nanos;
use crate::writer;
use shardstore_storage::copy_range;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A write that is durable but not yet committed to the entity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    /// Store into the head file, which had `committed_length` bytes before.
    Store { file_number: u64, committed_length: u64 },
    /// Import into a file created for it.
    Import { file_number: u64 },
}

/// Where a store or import put its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WrittenChunk {
    pub(crate) file_number: u64,
    pub(crate) position: u64,
    pub(crate) length: u64,
}

/// Owns a channel's data files and transactions log.
///
/// Every physical change is recorded in the log: file creations,
/// truncations and deletions before they are applied, appended data
/// (stores and transfers) after it was synced. The highest numbered file
/// is the head file; all appends go there.
#[derive(Debug)]
pub(crate) struct FileManager {
    ctx: FileContext,
    files: BTreeMap<u64, LiveDataFile>,
    log: TransactionsLog,
    pending_deletes: Vec<Arc<StoredFile>>,
    max_file_number: u64,
    pending_write: Option<PendingWrite>,
    cleanup_cursor: u64,
}

impl FileManager {
    pub(crate) fn new(
        ctx: FileContext,
        files: BTreeMap<u64, LiveDataFile>,
        log: TransactionsLog,
        max_file_number: u64,
    ) -> Self {
        Self {
            ctx,
            files,
            log,
            pending_deletes: Vec::new(),
            max_file_number,
            pending_write: None,
            cleanup_cursor: 0,
        }
    }

    pub(crate) const fn channel(&self) -> usize {
        self.ctx.channel
    }

    pub(crate) fn file_count(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn file_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.files.keys().copied()
    }

    pub(crate) fn log(&self) -> &TransactionsLog {
        &self.log
    }

    pub(crate) fn head_number(&self) -> CoreResult<u64> {
        self.files.keys().next_back().copied().ok_or_else(|| {
            CoreError::consistency(format!("channel {} has no head file", self.ctx.channel))
        })
    }

    fn file(&self, number: u64) -> CoreResult<&LiveDataFile> {
        self.files.get(&number).ok_or_else(|| {
            CoreError::consistency(format!("channel {} has no data file {number}", self.ctx.channel))
        })
    }

    /// Reads the committed content of a data file.
    pub(crate) fn read_committed(&self, number: u64) -> CoreResult<Vec<u8>> {
        let file = self.file(number)?;
        file.file().read_at(0, file.total_length())
    }

    pub(crate) fn add_live_content(&mut self, number: u64, length: u64) {
        if let Some(file) = self.files.get_mut(&number) {
            file.add_content(length);
        }
    }

    /// Creates a new head file and records its creation.
    pub(crate) fn create_head_file(&mut self, timestamp: i64) -> CoreResult<u64> {
        let number = self.max_file_number + 1;
        self.log.append(&TransactionEntry::FileCreation {
            timestamp,
            file_length: 0,
            file_number: number,
        })?;
        let file = StoredFile::open(
            self.ctx.fs.as_ref(),
            &self.ctx.layout,
            FileIdentity::data(self.ctx.channel, number),
        )?;
        self.files.insert(number, LiveDataFile::new(number, Arc::new(file), 0));
        self.max_file_number = number;
        self.ctx.stats.record_file_created();
        debug!(channel = self.ctx.channel, file = number, "data file created");
        Ok(number)
    }

    /// Starts a new head file unless the current one can take
    /// `pending_length` more bytes.
    pub(crate) fn ensure_head_capacity(&mut self, timestamp: i64, pending_length: u64) -> CoreResult<u64> {
        match self.files.values().next_back() {
            Some(head) if !self.ctx.evaluator.needs_retirement(head.total_length(), pending_length) => {
                Ok(head.number())
            }
            _ => self.create_head_file(timestamp),
        }
    }

    fn append_synced(&mut self, number: u64, data: &[u8]) -> CoreResult<u64> {
        let file = Arc::clone(self.file(number)?.file());
        let position = self.ctx.writer.append(&file, data)?;
        writer::sync(&file)?;
        if let Some(live) = self.files.get_mut(&number) {
            live.grow(data.len() as u64);
        }
        Ok(position)
    }

    fn total_length(&self, number: u64) -> CoreResult<u64> {
        Ok(self.file(number)?.total_length())
    }

    /// Appends a store's records to the head file and logs the store.
    ///
    /// An empty partition still logs the store, so every channel has an
    /// entry for every store timestamp.
    pub(crate) fn write_store(&mut self, timestamp: i64, data: &[u8]) -> CoreResult<WrittenChunk> {
        let file_number = if data.is_empty() {
            self.head_number()?
        } else {
            self.ensure_head_capacity(timestamp, data.len() as u64)?
        };
        let committed_length = self.total_length(file_number)?;
        self.pending_write = Some(PendingWrite::Store {
            file_number,
            committed_length,
        });
        let position = if data.is_empty() {
            committed_length
        } else {
            self.append_synced(file_number, data)?
        };
        self.log.append(&TransactionEntry::Store {
            timestamp,
            file_length: self.total_length(file_number)?,
        })?;
        Ok(WrittenChunk {
            file_number,
            position,
            length: data.len() as u64,
        })
    }

    /// Writes imported records into a new file of their own and logs them
    /// as a store. An empty partition only logs the store.
    pub(crate) fn write_import(&mut self, timestamp: i64, data: &[u8]) -> CoreResult<WrittenChunk> {
        if data.is_empty() {
            return self.write_store(timestamp, data);
        }
        let file_number = self.create_head_file(timestamp)?;
        self.pending_write = Some(PendingWrite::Import { file_number });
        let position = self.append_synced(file_number, data)?;
        self.log.append(&TransactionEntry::Store {
            timestamp,
            file_length: self.total_length(file_number)?,
        })?;
        Ok(WrittenChunk {
            file_number,
            position,
            length: data.len() as u64,
        })
    }

    /// Accounts a written chunk as live content.
    pub(crate) fn commit_write(&mut self, chunk: &WrittenChunk) {
        if let Some(file) = self.files.get_mut(&chunk.file_number) {
            file.add_content(chunk.length);
        }
        self.pending_write = None;
        self.cleanup_cursor = 0;
    }

    /// Undoes the pending write: a store is truncated away, an import file
    /// is deleted.
    pub(crate) fn rollback_write(&mut self) -> CoreResult<()> {
        match self.pending_write.take() {
            None => Ok(()),
            Some(PendingWrite::Store {
                file_number,
                committed_length,
            }) => {
                if self.total_length(file_number)? > committed_length {
                    self.truncate_file(file_number, committed_length)?;
                }
                Ok(())
            }
            Some(PendingWrite::Import { file_number }) => self.delete_file(file_number),
        }
    }

    /// Cuts a file back, logging the truncation first.
    pub(crate) fn truncate_file(&mut self, number: u64, length: u64) -> CoreResult<()> {
        let live = self.file(number)?;
        let old_length = live.total_length();
        let file = Arc::clone(live.file());
        self.log.append(&TransactionEntry::FileTruncation {
            timestamp: now_nanos(),
            file_length: length,
            file_number: number,
            old_length,
        })?;
        self.ctx.writer.truncate(&file, length)?;
        if let Some(live) = self.files.get_mut(&number) {
            live.cut_to(length);
        }
        self.ctx.stats.record_file_truncated();
        info!(channel = self.ctx.channel, file = number, old_length, length, "data file truncated");
        Ok(())
    }

    /// Removes a file, logging the deletion first. The physical deletion
    /// waits while the backup or an export still uses the file.
    pub(crate) fn delete_file(&mut self, number: u64) -> CoreResult<()> {
        let live = self.file(number)?;
        let (length, file) = (live.total_length(), Arc::clone(live.file()));
        self.log.append(&TransactionEntry::FileDeletion {
            timestamp: now_nanos(),
            file_length: length,
            file_number: number,
        })?;
        self.files.remove(&number);
        self.ctx.stats.record_file_deleted();
        file.release_user(FileUser::Channel);
        if file.has_foreign_users() {
            warn!(channel = self.ctx.channel, file = number, "deletion deferred, file still in use");
            self.pending_deletes.push(file);
            return Ok(());
        }
        self.ctx.writer.delete(&file)
    }

    fn retry_pending_deletes(&mut self) -> CoreResult<()> {
        let mut index = 0;
        while index < self.pending_deletes.len() {
            if self.pending_deletes[index].has_foreign_users() {
                index += 1;
                continue;
            }
            let file = self.pending_deletes.swap_remove(index);
            self.ctx.writer.delete(&file)?;
            debug!(channel = self.ctx.channel, file = %file.identity(), "deferred deletion done");
        }
        Ok(())
    }

    pub(crate) fn has_pending_deletes(&self) -> bool {
        !self.pending_deletes.is_empty()
    }

    fn is_dissolvable(&self, number: u64, head: u64, cache: &EntityCache) -> bool {
        self.files.get(&number).map_or(false, |file| {
            let metrics = file.metrics(cache.file_entity_count(number), number == head);
            self.ctx.evaluator.needs_dissolving(&metrics)
        })
    }

    /// Dissolves files the data file policy rejects, resuming where the
    /// last call stopped. Returns true once every file was checked.
    pub(crate) fn incremental_cleanup(&mut self, cache: &mut EntityCache, deadline: Option<Instant>) -> CoreResult<bool> {
        self.retry_pending_deletes()?;
        loop {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            let head = self.head_number()?;
            let view: &EntityCache = cache;
            let candidate = self
                .files
                .range(self.cleanup_cursor..)
                .map(|(number, _)| *number)
                .find(|number| self.is_dissolvable(*number, head, view));
            let Some(number) = candidate else {
                self.cleanup_cursor = 0;
                self.check_transactions_compaction()?;
                return Ok(true);
            };
            self.cleanup_cursor = number;
            if !self.dissolve(cache, number, deadline)? {
                return Ok(false);
            }
        }
    }

    /// Moves every live entity of `number` to the head file and deletes
    /// the file. Returns false if the deadline interrupted the move.
    fn dissolve(&mut self, cache: &mut EntityCache, number: u64, deadline: Option<Instant>) -> CoreResult<bool> {
        if number == self.head_number()? {
            self.create_head_file(now_nanos())?;
        }
        while cache.file_entity_count(number) > 0 {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            self.transfer_run(cache, number)?;
        }
        cache.remove_file(number)?;
        self.delete_file(number)?;
        info!(channel = self.ctx.channel, file = number, "data file dissolved");
        Ok(true)
    }

    /// Copies the leading run of back-to-back entities of `source` that
    /// fits into the head file. A run whose first entity does not fit goes
    /// to a new head file.
    fn transfer_run(&mut self, cache: &mut EntityCache, source: u64) -> CoreResult<()> {
        let max = self.ctx.evaluator.max_file_size();
        let mut head = self.head_number()?;
        let mut run = cache.leading_run(source, max.saturating_sub(self.total_length(head)?));
        let Some(first_length) = run.first().map(|entity| entity.length) else {
            return Ok(());
        };
        if self.ctx.evaluator.needs_retirement(self.total_length(head)?, first_length) {
            head = self.create_head_file(now_nanos())?;
            run = cache.leading_run(source, max);
        }
        let (Some(first), Some(last)) = (run.first(), run.last()) else {
            return Ok(());
        };
        let start = first.position;
        let length = last.position + last.length - start;

        let source_file = Arc::clone(self.file(source)?.file());
        let head_file = Arc::clone(self.file(head)?.file());
        let target_position = self.ctx.writer.copy(&source_file, start, length, &head_file)?;
        writer::sync(&head_file)?;
        if let Some(head_live) = self.files.get_mut(&head) {
            head_live.grow(length);
            head_live.add_content(length);
        }
        if let Some(source_live) = self.files.get_mut(&source) {
            source_live.release_content(length);
        }
        for entity in &run {
            cache.relocate(entity.key, head, target_position + (entity.position - start))?;
        }
        self.log.append(&TransactionEntry::Transfer {
            timestamp: now_nanos(),
            file_length: self.total_length(head)?,
            source_file_number: source,
            source_offset: start,
        })?;
        self.ctx.stats.record_transfer(length);
        debug!(channel = self.ctx.channel, source, head, length, entities = run.len(), "entities transferred");
        Ok(())
    }

    /// Rewrites the transactions log if it outgrew its limit.
    pub(crate) fn check_transactions_compaction(&mut self) -> CoreResult<()> {
        if self.log.length() <= self.ctx.evaluator.transactions_file_max_size() || self.has_pending_deletes() {
            return Ok(());
        }
        let analysis = TransactionsAnalysis::analyze(&self.log.file().read_all()?)?;
        let existing: BTreeSet<u64> = self.files.keys().copied().collect();
        let entries = cleaner::compact(&analysis, &existing)?;
        let old_length = self.log.length();
        self.log.rewrite(&encode_all(&entries))?;
        self.ctx.stats.record_transactions_compaction();
        info!(
            channel = self.ctx.channel,
            old_length,
            length = self.log.length(),
            "transactions log compacted"
        );
        Ok(())
    }

    pub(crate) fn statistics(&self, cache: &EntityCache) -> ChannelStatistics {
        let files = self
            .files
            .values()
            .map(|file| file.statistics(cache.file_entity_count(file.number())))
            .collect();
        ChannelStatistics::new(self.ctx.channel, files)
    }

    /// Copies the committed content of every data file and the log into
    /// the same channel files below `target`.
    pub(crate) fn export_to(&self, target: &StorageLayout) -> CoreResult<()> {
        let fs = self.ctx.fs.as_ref();
        fs.create_dir_all(&target.channel_directory(self.ctx.channel))?;
        let copies = self
            .files
            .values()
            .map(|file| (Arc::clone(file.file()), file.total_length()))
            .chain(std::iter::once((Arc::clone(self.log.file()), self.log.length())));
        for (file, length) in copies {
            let path = target.path(file.identity());
            if fs.exists(&path) {
                fs.delete(&path)?;
            }
            file.register_user(FileUser::Export);
            let result = (|| -> CoreResult<()> {
                let mut out = fs.open(&path)?;
                file.with_backend(|backend| copy_range(&*backend, 0, length, out.as_mut()))?;
                out.sync()?;
                Ok(())
            })();
            file.release_user(FileUser::Export);
            result?;
        }
        debug!(channel = self.ctx.channel, target = %target.base().display(), "channel exported");
        Ok(())
    }

    /// Syncs every open file.
    pub(crate) fn sync_all(&self) -> CoreResult<()> {
        for file in self.files.values() {
            writer::sync(file.file())?;
        }
        writer::sync(self.log.file())
    }
}

impl DataFileAccess for FileManager {
    fn read_record(&self, file_number: u64, position: u64, length: u64) -> CoreResult<Vec<u8>> {
        self.file(file_number)?.file().read_at(position, length)
    }

    fn release_content(&mut self, file_number: u64, length: u64) {
        if let Some(file) = self.files.get_mut(&file_number) {
            file.release_content(length);
        }
        self.cleanup_cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::super::initializer::tests::{records, store, Harness};
    use super::*;
    use crate::live::evaluator::DataFileEvaluator;
    use crate::types::ObjectId;
    use shardstore_storage::FileSystem;

    fn small_files() -> DataFileEvaluator {
        DataFileEvaluator::new(1024, 4096, 0.5, false).unwrap()
    }

    #[test]
    fn store_rollback_truncates_the_head() {
        let harness = Harness::new();
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1], b"kept"));
        manager.write_store(10, &records([2], b"lost")).unwrap();
        assert_eq!(harness.fs.file_size(&harness.data_path(1)).unwrap(), 56);

        manager.rollback_write().unwrap();
        assert_eq!(harness.fs.file_size(&harness.data_path(1)).unwrap(), 28);
        assert!(matches!(
            harness.log_entries().last(),
            Some(TransactionEntry::FileTruncation {
                file_length: 28,
                old_length: 56,
                ..
            })
        ));
        // nothing pending any more
        manager.rollback_write().unwrap();
        drop(manager);

        let (_, cache) = harness.start(20).unwrap();
        assert_eq!(cache.entity_count(), 1);
        assert!(cache.contains(ObjectId(1)));
    }

    #[test]
    fn empty_partition_logs_the_store() {
        let harness = Harness::new();
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 9, &[]);
        assert_eq!(
            harness.log_entries().last(),
            Some(&TransactionEntry::Store {
                timestamp: 9,
                file_length: 0,
            })
        );
    }

    #[test]
    fn import_rollback_reverts_the_head() {
        let harness = Harness::new();
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1], b"a"));
        let chunk = manager.write_import(10, &records([2, 3], b"b")).unwrap();
        assert_eq!(chunk.file_number, 2);
        assert_eq!(manager.head_number().unwrap(), 2);

        manager.rollback_write().unwrap();
        assert_eq!(manager.head_number().unwrap(), 1);
        assert!(!harness.fs.exists(&harness.data_path(2)));
        drop(manager);

        let (manager, cache) = harness.start(20).unwrap();
        assert_eq!(manager.head_number().unwrap(), 1);
        assert_eq!(cache.entity_count(), 1);
    }

    #[test]
    fn sparse_file_is_dissolved_into_the_head() {
        let harness = Harness::with_evaluator(small_files());
        let (mut manager, mut cache) = harness.start(1).unwrap();
        // 256 byte records
        store(&mut manager, &mut cache, 5, &records(1..=4, &[1; 232]));
        manager.create_head_file(6).unwrap();
        store(&mut manager, &mut cache, 7, &records(1..=3, &[2; 232]));

        assert!(manager.incremental_cleanup(&mut cache, None).unwrap());
        assert_eq!(manager.file_numbers().collect::<Vec<_>>(), vec![2]);
        assert!(!harness.fs.exists(&harness.data_path(1)));

        let key = cache.lookup(ObjectId(4)).unwrap();
        let record = cache.load(key, &manager).unwrap();
        assert_eq!(record[24..], [1; 232]);
        let statistics = manager.statistics(&cache);
        assert_eq!(statistics.files[0].file_length, 1024);
        assert_eq!(statistics.files[0].live_data_length, 1024);

        let entries = harness.log_entries();
        assert!(entries.contains(&TransactionEntry::Transfer {
            timestamp: entries
                .iter()
                .find_map(|entry| match entry {
                    TransactionEntry::Transfer { timestamp, .. } => Some(*timestamp),
                    _ => None,
                })
                .unwrap(),
            file_length: 1024,
            source_file_number: 1,
            source_offset: 768,
        }));
        assert_eq!(harness.stats.snapshot().transferred_bytes, 256);
        drop(manager);

        let (_, cache) = harness.start(30).unwrap();
        assert_eq!(cache.entity_count(), 4);
    }

    #[test]
    fn cleanup_settles_when_stores_overflow_the_head() {
        let harness = Harness::with_evaluator(DataFileEvaluator::new(1024, 4096, 0.5, true).unwrap());
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1], &[1; 2500]));
        store(&mut manager, &mut cache, 6, &records([2], &[2; 2500]));
        assert_eq!(manager.file_numbers().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(manager.total_length(1).unwrap(), 2524);

        let deadline = Instant::now() + std::time::Duration::from_millis(500);
        assert!(manager.incremental_cleanup(&mut cache, Some(deadline)).unwrap());
        assert_eq!(manager.file_numbers().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(manager.max_file_number, 2);
    }

    #[test]
    fn oversized_head_is_split_on_transfer() {
        let harness = Harness::with_evaluator(DataFileEvaluator::new(1024, 4096, 0.5, true).unwrap());
        let (mut manager, mut cache) = harness.start(1).unwrap();
        // an empty head takes a store larger than a file, 1524 byte records
        store(&mut manager, &mut cache, 5, &records(1..=4, &[3; 1500]));
        assert_eq!(manager.total_length(1).unwrap(), 6096);

        assert!(manager.incremental_cleanup(&mut cache, None).unwrap());
        let statistics = manager.statistics(&cache);
        assert_eq!(statistics.files.iter().map(|file| file.entity_count).sum::<u64>(), 4);
        for file in &statistics.files {
            assert!(file.file_length <= 4096, "{file:?}");
        }
        assert!(!harness.fs.exists(&harness.data_path(1)));
        assert!(manager.incremental_cleanup(&mut cache, None).unwrap());
        assert_eq!(manager.file_count(), statistics.files.len());
    }

    #[test]
    fn deletion_waits_for_foreign_users() {
        let harness = Harness::with_evaluator(small_files());
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1], &[0; 100]));
        manager.create_head_file(6).unwrap();
        store(&mut manager, &mut cache, 7, &records([1], &[1; 100]));
        let old = Arc::clone(manager.files[&1].file());
        old.register_user(FileUser::Backup);

        assert!(manager.incremental_cleanup(&mut cache, None).unwrap());
        assert!(manager.has_pending_deletes());
        assert!(harness.fs.exists(&harness.data_path(1)));

        old.release_user(FileUser::Backup);
        manager.incremental_cleanup(&mut cache, None).unwrap();
        assert!(!manager.has_pending_deletes());
        assert!(!harness.fs.exists(&harness.data_path(1)));
    }

    #[test]
    fn oversized_log_is_compacted() {
        let evaluator = small_files().with_transactions_file_max_size(1024).unwrap();
        let harness = Harness::with_evaluator(evaluator);
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1, 2], b"x"));
        for timestamp in 10..80 {
            store(&mut manager, &mut cache, timestamp, &[]);
        }
        let before = manager.log().length();
        assert!(before > 1024);

        manager.check_transactions_compaction().unwrap();
        assert!(manager.log().length() < before);
        assert_eq!(harness.stats.snapshot().transactions_compactions, 1);
        drop(manager);

        let (_, cache) = harness.start(100).unwrap();
        assert_eq!(cache.entity_count(), 2);
    }

    #[test]
    fn export_copies_committed_files() {
        let harness = Harness::new();
        let (mut manager, mut cache) = harness.start(1).unwrap();
        store(&mut manager, &mut cache, 5, &records([1], b"abc"));
        let target = harness.layout().with_base("/export");
        manager.export_to(&target).unwrap();

        let exported = harness.fs.read_all(&target.path(FileIdentity::data(0, 1))).unwrap();
        assert_eq!(exported, records([1], b"abc"));
        assert!(harness.fs.exists(&target.path(FileIdentity::transactions(0))));
        assert!(!manager.files[&1].file().has_foreign_users());
    }
}
