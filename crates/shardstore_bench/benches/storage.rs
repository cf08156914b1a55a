//! File system backend benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardstore_bench::payload;
use shardstore_storage::{FileSystem, InMemoryFileSystem, LocalFileSystem, StorageBackend};
use std::path::Path;
use tempfile::TempDir;

/// Benchmark in-memory append operations.
fn bench_inmemory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_append");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let fs = InMemoryFileSystem::new();
            let mut backend = fs.open(Path::new("/bench/channel_0_1.dat")).unwrap();
            let data = payload(size);

            b.iter(|| {
                let offset = backend.append(black_box(&data)).unwrap();
                black_box(offset);
            });
        });
    }

    group.finish();
}

/// Benchmark in-memory read operations.
fn bench_inmemory_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_read");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let fs = InMemoryFileSystem::new();
            let mut backend = fs.open(Path::new("/bench/channel_0_1.dat")).unwrap();
            let offset = backend.append(&payload(size)).unwrap();

            b.iter(|| {
                let result = backend.read_at(black_box(offset), black_box(size)).unwrap();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn local_backend(temp_dir: &TempDir) -> Box<dyn StorageBackend> {
    LocalFileSystem::new()
        .open(&temp_dir.path().join("channel_0_1.dat"))
        .unwrap()
}

/// Benchmark local file append operations.
fn bench_file_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_append");
    group.sample_size(50);

    for size in [256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let mut backend = local_backend(&temp_dir);
            let data = payload(size);

            b.iter(|| {
                let offset = backend.append(black_box(&data)).unwrap();
                black_box(offset);
            });
        });
    }

    group.finish();
}

/// Benchmark an append followed by a sync, as done for every store.
fn bench_file_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_sync");
    group.sample_size(20);

    let temp_dir = TempDir::new().unwrap();
    let mut backend = local_backend(&temp_dir);
    let data = payload(1024);

    group.bench_function("after_1kb_append", |b| {
        b.iter(|| {
            backend.append(&data).unwrap();
            backend.sync().unwrap();
        });
    });

    group.finish();
}

/// Benchmark the read pattern of cache misses: one record at a time in
/// scattered order.
fn bench_scattered_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("scattered_read");

    let record_size = 256;
    let record_count = 1000;

    group.bench_function("inmemory_1000_records", |b| {
        let fs = InMemoryFileSystem::new();
        let mut backend = fs.open(Path::new("/bench/channel_0_1.dat")).unwrap();
        let data = payload(record_size);
        let offsets: Vec<u64> = (0..record_count).map(|_| backend.append(&data).unwrap()).collect();

        let mut idx = 0;
        b.iter(|| {
            let offset = offsets[(idx * 7) % record_count];
            let result = backend.read_at(black_box(offset), black_box(record_size)).unwrap();
            idx = (idx + 1) % record_count;
            black_box(result);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_inmemory_append,
    bench_inmemory_read,
    bench_file_append,
    bench_file_sync,
    bench_scattered_read,
);
criterion_main!(benches);
