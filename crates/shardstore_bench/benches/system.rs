//! Storage operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardstore_bench::{blob_chunk, memory_storage};
use shardstore_core::ObjectId;
use shardstore_testkit::fixtures::{scenarios, BLOB_TYPE};
use std::time::Duration;

/// Benchmark stores of one batch across channel counts.
fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    for channels in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::from_parameter(channels), channels, |b, &channels| {
            let storage = memory_storage(channels);
            let chunk = blob_chunk(1, 100, 256);

            b.iter(|| storage.store(black_box(&chunk)).unwrap());
            storage.shutdown().unwrap();
        });
    }

    group.finish();
}

/// Benchmark loads by object ID from a populated storage.
fn bench_load_by_object_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_by_object_ids");

    for batch in [1u64, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let storage = memory_storage(4);
            storage.store(&blob_chunk(1, 10_000, 128)).unwrap();
            let ids: Vec<ObjectId> = (1..=batch).map(|i| ObjectId(i * 97 % 10_000 + 1)).collect();

            b.iter(|| {
                let loaded = storage.load_by_object_ids(black_box(&ids)).unwrap();
                black_box(loaded.byte_count());
            });
            storage.shutdown().unwrap();
        });
    }

    group.finish();
}

/// Benchmark loading every entity of one type.
fn bench_load_by_type(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_by_type");
    group.sample_size(20);

    let storage = memory_storage(4);
    storage.store(&blob_chunk(1, 10_000, 128)).unwrap();
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("10000_blobs", |b| {
        b.iter(|| black_box(storage.load_by_type_ids(&[BLOB_TYPE]).unwrap().chunks.len()));
    });
    storage.shutdown().unwrap();

    group.finish();
}

/// Benchmark full garbage collections after replacing the root.
fn bench_garbage_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("garbage_collection");
    group.sample_size(10);

    for count in [1_000u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let storage = memory_storage(4);
            b.iter(|| {
                storage.store(&scenarios::reachable_blobs(count, b"payload")).unwrap();
                storage
                    .issue_garbage_collection(Some(Duration::from_secs(60)))
                    .unwrap();
            });
            storage.shutdown().unwrap();
        });
    }

    group.finish();
}

/// Benchmark consolidating files after overwrites.
fn bench_file_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_check");
    group.sample_size(10);

    group.bench_function("overwrite_1000", |b| {
        let storage = memory_storage(4);
        b.iter(|| {
            storage.store(&blob_chunk(1, 1000, 200)).unwrap();
            storage.store(&blob_chunk(1, 1000, 100)).unwrap();
            black_box(storage.issue_file_check(None).unwrap());
        });
        storage.shutdown().unwrap();
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store,
    bench_load_by_object_ids,
    bench_load_by_type,
    bench_garbage_collection,
    bench_file_check,
);
criterion_main!(benches);
