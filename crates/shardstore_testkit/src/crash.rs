//! Crash recovery testing for shardstore.
//!
//! A storage never repairs anything while running: every interrupted
//! write is cleaned up at the next start, driven by the transactions logs.
//! This module simulates such interruptions and checks what a restart
//! makes of them.
//!
//! ## Test Strategy
//!
//! 1. **Crash during a store** - appends fail part-way through a write
//! 2. **Uncommitted tail** - a data file is longer than its log says
//! 3. **Partial log entry** - the log ends in the middle of an entry
//! 4. **Lost log** - the log is gone and is derived from the data files
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shardstore_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new(4);
//! harness.run_all();
//! assert!(harness.all_passed());
//! ```

use crate::fixtures::{loaded_contents, scenarios, test_config, RecordBuilder, TestStorage};
use shardstore_core::{CoreError, CoreResult, ObjectId, StorageConfig, TransactionEntry};
use shardstore_storage::{FileSystem, InMemoryFileSystem, StorageBackend, StorageError, StorageResult};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Appends fail part-way through a store.
    DuringStore,
    /// Data was appended but the store was never logged.
    UncommittedTail,
    /// The last log entry was only partly written.
    PartialLogEntry,
    /// The transactions log was lost.
    LostLog,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// The simulated crash.
    pub point: CrashPoint,
    /// Whether the test passed.
    pub passed: bool,
    /// Entities expected after recovery.
    pub expected_entities: usize,
    /// Entities found after recovery.
    pub actual_entities: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(point: CrashPoint, entities: usize) -> Self {
        Self {
            point,
            passed: true,
            expected_entities: entities,
            actual_entities: entities,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(point: CrashPoint, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            point,
            passed: false,
            expected_entities: expected,
            actual_entities: actual,
            error: Some(error.to_string()),
        }
    }
}

fn simulated(message: &str) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

#[derive(Debug)]
struct FaultState {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
    fail_deletes: AtomicBool,
    fail_reads: AtomicBool,
}

impl Default for FaultState {
    fn default() -> Self {
        Self {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }
}

/// A file system wrapper that can simulate crashes.
///
/// Every file opened through it shares one byte budget: once the budget is
/// used up, appends write what still fits and fail from then on, like a
/// process dying in the middle of a write.
#[derive(Debug)]
pub struct FaultyFileSystem {
    inner: Arc<dyn FileSystem>,
    state: Arc<FaultState>,
}

impl FaultyFileSystem {
    /// Wraps `inner` without any fault armed.
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState::default()),
        }
    }

    /// The wrapped file system.
    pub fn inner(&self) -> &Arc<dyn FileSystem> {
        &self.inner
    }

    /// Lets `bytes` more bytes be appended, then fails every append.
    pub fn crash_after(&self, bytes: usize) {
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush and sync fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.state.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Sets whether deleting files fails.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.state.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Sets whether reads from opened files fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn reset(&self) {
        self.state.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_on_sync.store(false, Ordering::SeqCst);
        self.state.fail_deletes.store(false, Ordering::SeqCst);
        self.state.fail_reads.store(false, Ordering::SeqCst);
    }

    /// Returns whether a simulated failure happened since the last reset.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }
}

impl FileSystem for FaultyFileSystem {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FaultyBackend {
            inner: self.inner.open(path)?,
            state: Arc::clone(&self.state),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        self.inner.file_size(path)
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_dir_all(path)
    }

    fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        self.inner.list_files(dir)
    }

    fn list_dirs(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        self.inner.list_dirs(dir)
    }

    fn delete(&self, path: &Path) -> StorageResult<()> {
        if self.state.fail_deletes.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated failure during delete"));
        }
        self.inner.delete(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.rename(from, to)
    }

    fn read_all(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read_all(path)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.inner.write_all(path, data)
    }
}

struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<FaultState>,
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if self.state.fail_reads.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated failure during read"));
        }
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self.state.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.state.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during write"));
        }

        // Write what fits before the crash point
        if current + data.len() > threshold {
            self.state.crashed.store(true, Ordering::SeqCst);
            let partial = threshold - current;
            let _ = self.inner.append(&data[..partial]);
            return Err(simulated("simulated crash during partial write"));
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.state.fail_on_sync.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.state.fail_on_sync.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Appends `len` garbage bytes to a file and returns its new size.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub fn append_garbage(fs: &dyn FileSystem, path: &Path, len: usize) -> StorageResult<u64> {
    let mut file = fs.open(path)?;
    file.append(&vec![0xAB; len])?;
    file.sync()?;
    file.size()
}

/// Appends the first half of a store entry to a transactions log.
///
/// # Errors
///
/// Returns an error if the log cannot be opened or written.
pub fn append_partial_entry(fs: &dyn FileSystem, path: &Path) -> StorageResult<()> {
    let entry = TransactionEntry::Store {
        timestamp: i64::MAX,
        file_length: u64::MAX,
    }
    .encode();
    let mut file = fs.open(path)?;
    file.append(&entry[..entry.len() / 2])?;
    file.sync()
}

/// Number of the highest data file of a channel on disk.
pub fn head_file_number(storage: &TestStorage, channel: usize) -> Option<u64> {
    storage
        .file_layout()
        .inventory(storage.fs().as_ref(), channel)
        .ok()?
        .data_files
        .keys()
        .next_back()
        .copied()
}

/// Test harness for crash recovery scenarios.
///
/// Every scenario starts from an empty in-memory file system.
#[derive(Debug)]
pub struct CrashRecoveryHarness {
    channel_count: usize,
    /// Results of the scenarios run so far.
    pub results: Vec<CrashRecoveryResult>,
}

const ENTITIES: u64 = 12;
const PAYLOAD: &[u8] = b"committed";

impl CrashRecoveryHarness {
    /// Creates a harness for storages with `channel_count` channels.
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            results: Vec::new(),
        }
    }

    fn config(&self) -> StorageConfig {
        test_config("/crash", self.channel_count)
    }

    fn fresh_fs() -> Arc<dyn FileSystem> {
        Arc::new(InMemoryFileSystem::new())
    }

    /// Counts the committed entities with their original payload.
    fn count_committed(storage: &TestStorage) -> CoreResult<usize> {
        let ids: Vec<ObjectId> = (1..=ENTITIES).map(ObjectId).collect();
        let loaded = storage.load_by_object_ids(&ids)?;
        Ok(loaded_contents(&loaded)
            .values()
            .filter(|content| content.as_slice() == PAYLOAD)
            .count())
    }

    fn record(&mut self, point: CrashPoint, outcome: CoreResult<usize>) -> CrashRecoveryResult {
        let expected = ENTITIES as usize;
        let result = match outcome {
            Ok(found) if found == expected => CrashRecoveryResult::pass(point, expected),
            Ok(found) => CrashRecoveryResult::fail(point, expected, found, "committed entities were lost"),
            Err(e) => CrashRecoveryResult::fail(point, expected, 0, &e.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    fn committed_storage(&self, fs: Arc<dyn FileSystem>) -> CoreResult<TestStorage> {
        let storage = TestStorage::with_file_system(fs, self.config())?;
        storage.store(&scenarios::reachable_blobs(ENTITIES, PAYLOAD))?;
        Ok(storage)
    }

    /// Tests that committed data survives appends failing in the middle
    /// of a later store.
    pub fn test_crash_during_store(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let fs = Self::fresh_fs();
            let faulty = Arc::new(FaultyFileSystem::new(Arc::clone(&fs)));
            let mut storage = self.committed_storage(Arc::clone(&faulty) as Arc<dyn FileSystem>)?;

            faulty.crash_after(10);
            let doomed = RecordBuilder::new()
                .blobs(1..=ENTITIES, b"overwritten")
                .build();
            if storage.store(&doomed).is_ok() {
                return Err(CoreError::consistency("store succeeded despite the crash"));
            }
            faulty.reset();
            // the disrupted storage only has threads left to stop
            let _ = storage.stop();

            let storage = TestStorage::with_file_system(fs, self.config())?;
            Self::count_committed(&storage)
        })();
        self.record(CrashPoint::DuringStore, outcome)
    }

    /// Tests that data appended without a logged store is cut off.
    pub fn test_uncommitted_tail_discarded(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut storage = self.committed_storage(Self::fresh_fs())?;
            storage.stop()?;
            let head = head_file_number(&storage, 0)
                .ok_or_else(|| CoreError::consistency("channel 0 has no data file"))?;
            let path = storage.data_file_path(0, head);
            let committed = storage.fs().file_size(&path)?;
            append_garbage(storage.fs().as_ref(), &path, 200)?;

            storage.start()?;
            if storage.fs().file_size(&path)? != committed {
                return Err(CoreError::consistency("uncommitted tail was kept"));
            }
            Self::count_committed(&storage)
        })();
        self.record(CrashPoint::UncommittedTail, outcome)
    }

    /// Tests that a half-written trailing log entry is ignored.
    pub fn test_partial_log_entry_tolerated(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut storage = self.committed_storage(Self::fresh_fs())?;
            storage.stop()?;
            append_partial_entry(storage.fs().as_ref(), &storage.transactions_path(0))?;

            storage.start()?;
            storage.store(&RecordBuilder::new().blob(ENTITIES + 100, b"later").build())?;
            storage.restart()?;
            Self::count_committed(&storage)
        })();
        self.record(CrashPoint::PartialLogEntry, outcome)
    }

    /// Tests that a lost log is derived from the data files.
    pub fn test_lost_log_rederived(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut storage = self.committed_storage(Self::fresh_fs())?;
            storage.stop()?;
            storage.fs().delete(&storage.transactions_path(0))?;

            storage.start()?;
            if !storage.fs().exists(&storage.transactions_path(0)) {
                return Err(CoreError::consistency("transactions log was not rewritten"));
            }
            Self::count_committed(&storage)
        })();
        self.record(CrashPoint::LostLog, outcome)
    }

    /// Runs every scenario.
    pub fn run_all(&mut self) -> &[CrashRecoveryResult] {
        self.test_crash_during_store();
        self.test_uncommitted_tail_discarded();
        self.test_partial_log_entry_tolerated();
        self.test_lost_log_rederived();
        &self.results
    }

    /// Returns true if every scenario run so far passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|result| result.passed)
    }
}
