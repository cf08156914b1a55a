//! Benchmark utilities.

use shardstore_core::StorageSystem;
use shardstore_storage::{FileSystem, InMemoryFileSystem};
use shardstore_testkit::fixtures::{graph_dictionary, test_config, RecordBuilder};
use std::sync::Arc;

/// Deterministic payload of the specified size.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// A chunk of `count` leaf records with IDs starting at `first`.
pub fn blob_chunk(first: u64, count: u64, payload_size: usize) -> Vec<u8> {
    RecordBuilder::new()
        .blobs(first..first + count, &payload(payload_size))
        .build()
}

/// Starts an in-memory storage with `channel_count` channels.
///
/// # Panics
///
/// Panics if the storage does not start.
pub fn memory_storage(channel_count: usize) -> StorageSystem {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    StorageSystem::start(
        test_config("/bench", channel_count).without_lock_file(),
        fs,
        graph_dictionary(),
    )
    .expect("failed to start benchmark storage")
}
