//! Storage statistics.
//!
//! [`StorageStats`] holds monotonically increasing operation counters that
//! every channel updates lock-free. [`RawFileStatistics`] is a point-in-time
//! description of the data files, collected by the channels on request.
//!
//! # Usage
//!
//! ```rust,ignore
//! let storage = StorageSystem::start(config, fs, dictionary)?;
//! storage.store(&chunk)?;
//!
//! let stats = storage.stats();
//! println!("stores: {}", stats.stores);
//! println!("zombie IDs: {}", stats.zombie_object_ids);
//! ```

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage operation counters.
#[derive(Debug, Default)]
pub struct StorageStats {
    stores: AtomicU64,
    stored_entities: AtomicU64,
    stored_bytes: AtomicU64,
    loads: AtomicU64,
    loaded_bytes: AtomicU64,

    sweeps: AtomicU64,
    swept_entities: AtomicU64,
    zombie_object_ids: AtomicU64,
    cache_evictions: AtomicU64,

    files_created: AtomicU64,
    files_deleted: AtomicU64,
    files_truncated: AtomicU64,
    transfers: AtomicU64,
    transferred_bytes: AtomicU64,
    transactions_compactions: AtomicU64,

    failed_tasks: AtomicU64,
}

impl StorageStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_store(&self, entities: u64, bytes: u64) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.stored_entities.fetch_add(entities, Ordering::Relaxed);
        self.stored_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, bytes: u64) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.loaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, swept: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept_entities.fetch_add(swept, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie_object_id(&self) {
        self.zombie_object_ids.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_deleted(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_truncated(&self) {
        self.files_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self, bytes: u64) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_transactions_compaction(&self) {
        self.transactions_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_task(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of stored entities' references that named no
    /// entity.
    pub fn zombie_object_ids(&self) -> u64 {
        self.zombie_object_ids.load(Ordering::Relaxed)
    }

    /// Returns the number of completed store operations.
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Returns the number of entities removed by sweeps.
    pub fn swept_entities(&self) -> u64 {
        self.swept_entities.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            stores: load(&self.stores),
            stored_entities: load(&self.stored_entities),
            stored_bytes: load(&self.stored_bytes),
            loads: load(&self.loads),
            loaded_bytes: load(&self.loaded_bytes),
            sweeps: load(&self.sweeps),
            swept_entities: load(&self.swept_entities),
            zombie_object_ids: load(&self.zombie_object_ids),
            cache_evictions: load(&self.cache_evictions),
            files_created: load(&self.files_created),
            files_deleted: load(&self.files_deleted),
            files_truncated: load(&self.files_truncated),
            transfers: load(&self.transfers),
            transferred_bytes: load(&self.transferred_bytes),
            transactions_compactions: load(&self.transactions_compactions),
            failed_tasks: load(&self.failed_tasks),
        }
    }
}

/// A point-in-time copy of [`StorageStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Completed store operations.
    pub stores: u64,
    /// Entities written by stores.
    pub stored_entities: u64,
    /// Bytes written by stores.
    pub stored_bytes: u64,
    /// Completed load operations.
    pub loads: u64,
    /// Bytes returned by loads.
    pub loaded_bytes: u64,
    /// Per-channel sweeps.
    pub sweeps: u64,
    /// Entities removed by sweeps.
    pub swept_entities: u64,
    /// References to unknown object IDs found while marking.
    pub zombie_object_ids: u64,
    /// Cached records dropped by cache checks.
    pub cache_evictions: u64,
    /// Data files created.
    pub files_created: u64,
    /// Data files deleted.
    pub files_deleted: u64,
    /// Data files truncated.
    pub files_truncated: u64,
    /// Transfers between data files.
    pub transfers: u64,
    /// Bytes moved by transfers.
    pub transferred_bytes: u64,
    /// Transactions log rewrites.
    pub transactions_compactions: u64,
    /// Tasks that failed on at least one channel.
    pub failed_tasks: u64,
}

/// Statistics of one data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatistics {
    /// File number within its channel.
    pub number: u64,
    /// Path of the file.
    pub path: PathBuf,
    /// Bytes written to the file.
    pub file_length: u64,
    /// Bytes of live entity records.
    pub live_data_length: u64,
    /// Live entities in the file.
    pub entity_count: u64,
}

/// Statistics of one channel's data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatistics {
    /// Channel index.
    pub channel: usize,
    /// Number of data files.
    pub file_count: u64,
    /// Live bytes across the files.
    pub live_data_length: u64,
    /// Total bytes across the files.
    pub total_data_length: u64,
    /// Per-file details, ordered by number.
    pub files: Vec<FileStatistics>,
}

impl ChannelStatistics {
    pub(crate) fn new(channel: usize, files: Vec<FileStatistics>) -> Self {
        Self {
            channel,
            file_count: files.len() as u64,
            live_data_length: files.iter().map(|f| f.live_data_length).sum(),
            total_data_length: files.iter().map(|f| f.file_length).sum(),
            files,
        }
    }
}

/// Statistics of all data files of a storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFileStatistics {
    /// When the statistics were collected, in epoch milliseconds.
    pub creation_time_ms: i64,
    /// Number of data files.
    pub file_count: u64,
    /// Live bytes across all files.
    pub live_data_length: u64,
    /// Total bytes across all files.
    pub total_data_length: u64,
    /// Per-channel details, ordered by channel.
    pub channels: Vec<ChannelStatistics>,
}

impl RawFileStatistics {
    pub(crate) fn new(creation_time_ms: i64, channels: Vec<ChannelStatistics>) -> Self {
        Self {
            creation_time_ms,
            file_count: channels.iter().map(|c| c.file_count).sum(),
            live_data_length: channels.iter().map(|c| c.live_data_length).sum(),
            total_data_length: channels.iter().map(|c| c.total_data_length).sum(),
            channels,
        }
    }

    /// Ratio of live to total bytes; 1.0 for an empty storage.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        if self.total_data_length == 0 {
            1.0
        } else {
            self.live_data_length as f64 / self.total_data_length as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StorageStats::new();
        stats.record_store(3, 120);
        stats.record_store(1, 30);
        stats.record_zombie_object_id();
        stats.record_transfer(64);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.stores, 2);
        assert_eq!(snapshot.stored_entities, 4);
        assert_eq!(snapshot.stored_bytes, 150);
        assert_eq!(snapshot.zombie_object_ids, 1);
        assert_eq!(snapshot.transferred_bytes, 64);
        assert_eq!(stats.stores(), 2);
    }

    #[test]
    fn raw_statistics_sum_up() {
        let file = |number, length, live| FileStatistics {
            number,
            path: PathBuf::from(format!("f{number}")),
            file_length: length,
            live_data_length: live,
            entity_count: 1,
        };
        let channels = vec![
            ChannelStatistics::new(0, vec![file(1, 100, 50), file(2, 100, 100)]),
            ChannelStatistics::new(1, vec![file(1, 200, 50)]),
        ];
        let statistics = RawFileStatistics::new(0, channels);
        assert_eq!(statistics.file_count, 3);
        assert_eq!(statistics.total_data_length, 400);
        assert_eq!(statistics.live_data_length, 200);
        assert!((statistics.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
