//! Stress tests for shardstore.
//!
//! These helpers drive a storage with many operations, optionally from
//! several threads, and count what went wrong.

use crate::fixtures::{loaded_contents, scenarios, RecordBuilder};
use shardstore_core::{ObjectId, StorageSystem};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Size of entity payloads in bytes.
    pub entity_size: usize,
    /// Number of distinct entities.
    pub entity_count: u64,
    /// Entities per store or load.
    pub batch_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            entity_size: 64,
            entity_count: 1_000,
            batch_size: 10,
        }
    }
}

fn payload(config: &StressConfig) -> Vec<u8> {
    vec![0xAB; config.entity_size]
}

/// Stores leaves `1..=entity_count` and a root referencing all of them.
///
/// # Panics
///
/// Panics if the store fails.
pub fn populate(storage: &StorageSystem, config: &StressConfig) {
    storage
        .store(&scenarios::reachable_blobs(config.entity_count, &payload(config)))
        .expect("failed to populate storage");
}

/// The `batch`-th window of `batch_size` IDs, wrapping around the
/// populated range.
fn batch_ids(config: &StressConfig, batch: usize) -> Vec<ObjectId> {
    (0..config.batch_size)
        .map(|i| ObjectId(((batch * config.batch_size + i) as u64 % config.entity_count) + 1))
        .collect()
}

/// Loads `ids` and checks every entity came back with the populated
/// payload.
fn load_intact(storage: &StorageSystem, ids: &[ObjectId], expected: &[u8]) -> bool {
    match storage.load_by_object_ids(ids) {
        Ok(loaded) => {
            let contents = loaded_contents(&loaded);
            loaded.missing.is_empty()
                && contents.len() == ids.len()
                && contents.values().all(|content| content.as_slice() == expected)
        }
        Err(_) => false,
    }
}

/// Run a sequential store stress test: every operation overwrites one
/// batch of the populated entities.
pub fn stress_sequential_stores(storage: &StorageSystem, config: &StressConfig) -> StressTestResult {
    let data = payload(config);

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for batch in 0..config.operations {
        let ids = batch_ids(config, batch);
        let chunk = RecordBuilder::new().blobs(ids.iter().map(|id| id.0), &data).build();
        match storage.store(&chunk) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a concurrent load stress test on a populated storage.
pub fn stress_concurrent_loads(storage: &StorageSystem, config: &StressConfig) -> StressTestResult {
    let data = payload(config);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads {
            let (successful, failed, data) = (&successful, &failed, &data);
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let ids = batch_ids(config, t * ops_per_thread + i);
                    if load_intact(storage, &ids, data) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run concurrent loads of reachable entities while another thread keeps
/// storing unreachable garbage and issuing budgeted garbage collections.
///
/// Only the loads count as operations; a load fails if any reachable
/// entity is missing or altered.
pub fn stress_loads_during_gc(storage: &StorageSystem, config: &StressConfig) -> StressTestResult {
    let data = payload(config);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let loading = AtomicBool::new(true);
    let ops_per_thread = config.operations / config.threads.max(1);
    let first_garbage_id = scenarios::root_id(config.entity_count) + 1;

    let start = Instant::now();
    thread::scope(|scope| {
        let loading = &loading;
        scope.spawn(move || {
            let mut round = 0u64;
            while loading.load(Ordering::Acquire) {
                let first = first_garbage_id + round * 16;
                let garbage = RecordBuilder::new().blobs(first..first + 16, b"garbage").build();
                let _ = storage.store(&garbage);
                let _ = storage.issue_garbage_collection(Some(Duration::from_millis(1)));
                round += 1;
            }
        });

        let loaders: Vec<_> = (0..config.threads)
            .map(|t| {
                let (successful, failed, data) = (&successful, &failed, &data);
                scope.spawn(move || {
                    for i in 0..ops_per_thread {
                        let ids = batch_ids(config, t * ops_per_thread + i);
                        if load_intact(storage, &ids, data) {
                            successful.fetch_add(1, Ordering::Relaxed);
                        } else {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for loader in loaders {
            loader.join().expect("loader thread panicked");
        }
        loading.store(false, Ordering::Release);
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run overwrites with alternating payload lengths, checking the data
/// files every `batch_size` stores.
pub fn stress_overwrite_and_consolidate(storage: &StorageSystem, config: &StressConfig) -> StressTestResult {
    let short = vec![0x11; config.entity_size / 2];
    let long = vec![0x22; config.entity_size];

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let data = if i % 2 == 0 { &short } else { &long };
        let chunk = RecordBuilder::new()
            .blobs(batch_ids(config, i).iter().map(|id| id.0), data)
            .build();
        let stored = storage.store(&chunk).is_ok();
        let checked = (i + 1) % config.batch_size.max(1) != 0 || storage.issue_file_check(None).is_ok();
        if stored && checked {
            successful += 1;
        } else {
            failed += 1;
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStorage;

    fn small() -> StressConfig {
        StressConfig {
            operations: 200,
            threads: 4,
            entity_size: 32,
            entity_count: 100,
            batch_size: 5,
        }
    }

    #[test]
    fn test_sequential_stores() {
        let storage = TestStorage::memory(4);
        let config = small();
        populate(&storage, &config);

        let result = stress_sequential_stores(&storage, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
    }

    #[test]
    fn test_concurrent_loads() {
        let storage = TestStorage::memory(4);
        let config = small();
        populate(&storage, &config);

        let result = stress_concurrent_loads(&storage, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, 200);
    }

    #[test]
    fn test_overwrite_and_consolidate() {
        let storage = TestStorage::memory(2);
        let config = small();
        populate(&storage, &config);

        let result = stress_overwrite_and_consolidate(&storage, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(storage.create_raw_file_statistics().unwrap().channels.len(), 2);
    }
}
