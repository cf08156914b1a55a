//! End-to-end properties of stores, loads, garbage collection and data
//! file consolidation.

use shardstore_core::{
    CoreError, DataFileEvaluator, DefaultCacheEvaluator, EntityCacheEvaluator, ObjectId, RawFileStatistics,
    SimpleTypeDictionary, StorageSystem, TypeLayout,
};
use shardstore_storage::{FileSystem, InMemoryFileSystem};
use shardstore_testkit::prelude::*;
use std::sync::Arc;

const MIN_FILE: u64 = 1024;
const MAX_FILE: u64 = 4096;
const MIN_RATIO: f64 = 0.75;

fn small_files() -> DataFileEvaluator {
    DataFileEvaluator::new(MIN_FILE, MAX_FILE, MIN_RATIO, true).unwrap()
}

fn storage_with_small_files(channel_count: usize) -> TestStorage {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let config = test_config("/small", channel_count).data_files(small_files());
    TestStorage::with_file_system(fs, config).unwrap()
}

fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<ObjectId> {
    range.map(ObjectId).collect()
}

#[test]
fn entities_live_in_the_channel_of_their_object_id() {
    for count in [1usize, 2, 4, 8, 1024] {
        for id in [1u64, 7, 1023, 1024, 1025, u64::MAX] {
            assert_eq!(ObjectId(id).channel(count) as u64, id & (count as u64 - 1));
        }
    }

    let storage = TestStorage::memory(4);
    storage.store(&RecordBuilder::new().blobs(1..=16, b"x").build()).unwrap();
    storage.store(&RecordBuilder::new().blobs(17..=19, b"y").build()).unwrap();
    let statistics = storage.create_raw_file_statistics().unwrap();
    let per_channel: Vec<u64> = statistics
        .channels
        .iter()
        .map(|channel| channel.files.iter().map(|file| file.entity_count).sum())
        .collect();
    // 17 -> 1, 18 -> 2, 19 -> 3
    assert_eq!(per_channel, vec![4, 5, 5, 5]);
}

#[test]
fn channel_counts_must_be_powers_of_two_up_to_1024() {
    for count in [0usize, 3, 5, 100, 1025] {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let result = StorageSystem::start(test_config("/counts", count), fs, graph_dictionary());
        assert!(
            matches!(result, Err(CoreError::InvalidConfiguration { .. })),
            "channel count {count} was accepted"
        );
    }

    let storage = TestStorage::memory(1024);
    storage.store(&RecordBuilder::new().blobs(1..=2048, b"z").build()).unwrap();
    let loaded = storage.load_by_object_ids(&[ObjectId(1), ObjectId(1024), ObjectId(2048)]).unwrap();
    assert_eq!(loaded_object_ids(&loaded), vec![1, 1024, 2048]);
    storage.shutdown().unwrap();
}

#[test]
fn consolidation_keeps_exactly_one_copy_of_the_newest_version() {
    let storage = storage_with_small_files(1);
    // 124 and 144 byte records
    storage.store(&RecordBuilder::new().blobs(1..=10, &[1; 100]).build()).unwrap();
    storage.store(&RecordBuilder::new().blobs(1..=10, &[2; 120]).build()).unwrap();

    assert!(storage.issue_file_check(None).unwrap());

    let loaded = storage.load_by_object_ids(&ids(1..=10)).unwrap();
    let contents = loaded_contents(&loaded);
    assert_eq!(contents.len(), 10);
    assert!(contents.values().all(|content| content == &[2; 120]));

    let statistics = storage.create_raw_file_statistics().unwrap();
    assert_eq!(statistics.file_count, 1);
    assert_eq!(statistics.live_data_length, 10 * 144);
    assert_eq!(statistics.total_data_length, 10 * 144);
    assert_eq!(statistics.channels[0].files[0].entity_count, 10);
    assert!(storage.stats().transfers > 0);
}

fn assert_files_within_policy(statistics: &RawFileStatistics) {
    for channel in &statistics.channels {
        let head = channel.files.iter().map(|file| file.number).max();
        for file in &channel.files {
            assert!(file.live_data_length <= file.file_length, "{file:?}");
            let fill_ratio = file.live_data_length as f64 / file.file_length.max(1) as f64;
            let oversized_single = file.entity_count == 1 && file.file_length > MAX_FILE;
            assert!(
                Some(file.number) == head || fill_ratio >= MIN_RATIO || oversized_single,
                "channel {} file {file:?} violates the data file policy",
                channel.channel
            );
        }
    }
}

#[test]
fn consolidated_files_are_full_head_or_single_oversized_entities() {
    let storage = storage_with_small_files(2);
    for round in 0..6u8 {
        let payload = vec![round; 60 + usize::from(round) * 30];
        storage.store(&RecordBuilder::new().blobs(1..=40, &payload).build()).unwrap();
        let overwrite = vec![round; 10];
        storage.store(&RecordBuilder::new().blobs((1..=40).step_by(3), &overwrite).build()).unwrap();
    }
    storage.store(&RecordBuilder::new().blob(100, &[9; 6000]).build()).unwrap();
    storage.store(&RecordBuilder::new().blobs(101..=110, &[8; 50]).build()).unwrap();

    assert!(storage.issue_file_check(None).unwrap());

    let statistics = storage.create_raw_file_statistics().unwrap();
    assert_files_within_policy(&statistics);
    let entities: u64 = statistics
        .channels
        .iter()
        .flat_map(|channel| channel.files.iter())
        .map(|file| file.entity_count)
        .sum();
    assert_eq!(entities, 51);
    let loaded = storage.load_by_object_ids(&[ObjectId(100)]).unwrap();
    assert_eq!(loaded_contents(&loaded)[&ObjectId(100)].len(), 6000);
}

#[test]
fn stores_that_do_not_fit_start_a_new_head() {
    let storage = storage_with_small_files(1);
    // 2457 byte records, 60% of the maximum file size
    storage.store(&RecordBuilder::new().blob(1, &[1; 2433]).build()).unwrap();
    storage.store(&RecordBuilder::new().blob(2, &[2; 2433]).build()).unwrap();

    assert!(storage.issue_file_check(None).unwrap());
    let files_created = storage.stats().files_created;
    assert!(storage.issue_file_check(None).unwrap());
    assert_eq!(storage.stats().files_created, files_created);

    let statistics = storage.create_raw_file_statistics().unwrap();
    assert_eq!(statistics.file_count, 2);
    for file in &statistics.channels[0].files {
        assert!(file.file_length <= MAX_FILE, "{file:?}");
    }
    assert_files_within_policy(&statistics);
    let loaded = storage.load_by_object_ids(&ids(1..=2)).unwrap();
    assert_eq!(loaded_object_ids(&loaded), vec![1, 2]);
}

#[test]
fn restore_with_different_length_does_not_grow_the_file_count() {
    let storage = TestStorage::memory(1);
    storage.store(&RecordBuilder::new().blob(1, b"first version").build()).unwrap();
    let files_before = storage.create_raw_file_statistics().unwrap().file_count;

    storage.store(&RecordBuilder::new().blob(1, b"second, longer version").build()).unwrap();
    assert!(storage.issue_file_check(None).unwrap());

    let statistics = storage.create_raw_file_statistics().unwrap();
    assert!(statistics.file_count <= files_before);
    assert_eq!(storage.data_file_count() as u64, statistics.file_count);
    let loaded = storage.load_by_object_ids(&[ObjectId(1)]).unwrap();
    assert_eq!(loaded_contents(&loaded)[&ObjectId(1)], b"second, longer version");
    assert_eq!(statistics.live_data_length, 24 + 22);
}

#[test]
fn reachable_entities_survive_gc_without_zombies() {
    let storage = TestStorage::memory(4);
    // root on channel 0, node on 1, blob on 2
    storage
        .store(&RecordBuilder::new().root(8, &[1, 2]).node(1, 2, b"n").blob(2, b"b").build())
        .unwrap();

    assert!(storage.issue_garbage_collection(None).unwrap());

    let loaded = storage.load_by_object_ids(&[ObjectId(8), ObjectId(1), ObjectId(2)]).unwrap();
    assert_eq!(loaded_object_ids(&loaded), vec![1, 2, 8]);
    assert_eq!(storage.stats().zombie_object_ids, 0);
    assert_eq!(storage.stats().swept_entities, 0);
}

#[test]
fn references_to_unknown_objects_count_as_zombies() {
    let storage = TestStorage::memory(2);
    storage.store(&RecordBuilder::new().root(10, &[11, 77]).blob(11, b"b").build()).unwrap();

    assert!(storage.issue_garbage_collection(None).unwrap());
    assert!(storage.stats().zombie_object_ids >= 1);
    let loaded = storage.load_by_object_ids(&[ObjectId(10), ObjectId(11)]).unwrap();
    assert_eq!(loaded_object_ids(&loaded), vec![10, 11]);
}

#[test]
fn second_full_gc_without_store_does_no_work() {
    let storage = TestStorage::memory(2);
    storage
        .store(&RecordBuilder::new().root(100, &[1, 2]).blobs(1..=3, b"leaf").build())
        .unwrap();

    assert!(storage.issue_garbage_collection(None).unwrap());
    let after_first = storage.stats();
    assert_eq!(after_first.swept_entities, 1);
    let loaded = storage.load_by_object_ids(&ids(1..=3)).unwrap();
    assert_eq!(loaded.missing, vec![ObjectId(3)]);

    assert!(storage.issue_garbage_collection(None).unwrap());
    let after_second = storage.stats();
    assert_eq!(after_second.sweeps, after_first.sweeps);
    assert_eq!(after_second.swept_entities, after_first.swept_entities);
}

#[test]
fn newer_root_replaces_the_old_graph() {
    let storage = TestStorage::memory(4);
    storage.store(&scenarios::chain(50, 1, 5)).unwrap();
    storage.store(&RecordBuilder::new().root(60, &[3]).build()).unwrap();

    assert_eq!(storage.load_roots().unwrap().root_object_id, ObjectId(60));
    assert!(storage.issue_garbage_collection(None).unwrap());

    let loaded = storage.load_by_object_ids(&ids(1..=5)).unwrap();
    assert_eq!(loaded_object_ids(&loaded), vec![3, 4, 5]);
    let roots = storage.load_roots().unwrap();
    assert_eq!(roots.root_object_id, ObjectId(60));
}

#[test]
fn invalid_records_are_rejected_without_side_effects() {
    let storage = TestStorage::memory(2);
    storage.store(&RecordBuilder::new().blob(1, b"ok").build()).unwrap();
    let files = storage.create_raw_file_statistics().unwrap();

    let unknown_type = RecordBuilder::new().blob(2, b"ok").entity(TypeId(99), 3, b"?").build();
    assert!(storage.store(&unknown_type).unwrap_err().is_validation());
    let short_node = RecordBuilder::new().entity(NODE_TYPE, 4, b"short").build();
    assert!(storage.store(&short_node).unwrap_err().is_validation());
    let null_id = RecordBuilder::new().blob(0, b"null").build();
    assert!(storage.store(&null_id).unwrap_err().is_validation());

    assert!(storage.is_running());
    assert_eq!(storage.create_raw_file_statistics().unwrap().total_data_length, files.total_data_length);
    let loaded = storage.load_by_object_ids(&[ObjectId(2)]).unwrap();
    assert_eq!(loaded.missing, vec![ObjectId(2)]);
}

#[test]
fn records_cutting_off_a_reference_are_rejected() {
    let dictionary = SimpleTypeDictionary::with_root_type(TypeId(1));
    dictionary.register(TypeLayout::new(TypeId(1), "Holder").with_references([0])).unwrap();
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let storage = StorageSystem::start(test_config("/refs", 2), fs, Arc::new(dictionary)).unwrap();

    let empty = RecordBuilder::new().entity(TypeId(1), 1, b"").build();
    assert!(storage.store(&empty).unwrap_err().is_validation());
    let short = RecordBuilder::new().entity(TypeId(1), 1, &[0; 7]).build();
    assert!(storage.store(&short).unwrap_err().is_validation());
    assert!(storage.is_running());

    let holder = RecordBuilder::new().entity(TypeId(1), 1, &0u64.to_le_bytes()).build();
    storage.store(&holder).unwrap();
    assert!(storage.issue_garbage_collection(None).unwrap());
    assert!(storage.is_running());
    let loaded = storage.load_by_object_ids(&[ObjectId(1)]).unwrap();
    assert!(loaded.missing.is_empty());
    storage.shutdown().unwrap();
}

#[test]
fn cache_check_keeps_entities_loadable() {
    let storage = TestStorage::memory(2);
    storage.store(&scenarios::reachable_blobs(50, &[5; 40])).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let evict_all: Arc<dyn EntityCacheEvaluator> = Arc::new(DefaultCacheEvaluator::new(1, 1).unwrap());
    assert!(storage.issue_cache_check(None, Some(evict_all)).unwrap());
    assert!(storage.issue_cache_check(None, None).unwrap());

    let loaded = storage.load_by_object_ids(&ids(1..=50)).unwrap();
    assert_eq!(loaded_contents(&loaded).len(), 50);
    assert!(storage.stats().cache_evictions > 0);
}

#[test]
fn statistics_and_type_loads_follow_stores() {
    let storage = TestStorage::memory(4);
    storage.store(&RecordBuilder::new().blobs(1..=8, b"b").node(9, 1, b"n").build()).unwrap();

    let blobs = storage.load_by_type_ids(&[BLOB_TYPE]).unwrap();
    assert_eq!(loaded_object_ids(&blobs), (1..=8).collect::<Vec<_>>());
    let stats = storage.stats();
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.stored_entities, 9);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.loaded_bytes, blobs.byte_count());
}
