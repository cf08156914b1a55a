//! The backup thread and startup synchronization.

use super::queue::{BackupItem, BackupItemQueue};
use crate::config::BackupConfig;
use crate::controller::OperationController;
use crate::error::{CoreError, CoreResult, ErrorCollector};
use crate::files::{FileIdentity, StorageLayout};
use crate::types::now_millis;
use parking_lot::Mutex;
use shardstore_storage::{copy_range, FileSystem, StorageBackend};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The backup directory, written by exactly one thread.
pub(crate) struct BackupTarget {
    fs: Arc<dyn FileSystem>,
    layout: StorageLayout,
    deletion_enabled: bool,
    deletion_directory: Option<PathBuf>,
    open: HashMap<FileIdentity, Box<dyn StorageBackend>>,
}

impl std::fmt::Debug for BackupTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupTarget")
            .field("base", &self.layout.base())
            .field("deletion_enabled", &self.deletion_enabled)
            .field("open", &self.open.len())
            .finish_non_exhaustive()
    }
}

impl BackupTarget {
    pub(crate) fn new(fs: Arc<dyn FileSystem>, primary: &StorageLayout, config: &BackupConfig) -> Self {
        Self {
            fs,
            layout: primary.with_base(&config.directory),
            deletion_enabled: config.deletion_enabled,
            deletion_directory: config.deletion_directory.clone(),
            open: HashMap::new(),
        }
    }

    fn backend(&mut self, identity: FileIdentity) -> CoreResult<&mut Box<dyn StorageBackend>> {
        if !self.open.contains_key(&identity) {
            let backend = self.fs.open(&self.layout.path(identity))?;
            self.open.insert(identity, backend);
        }
        self.open
            .get_mut(&identity)
            .ok_or_else(|| CoreError::consistency(format!("backup of {identity} not open")))
    }

    fn expect_size(backend: &dyn StorageBackend, identity: FileIdentity, expected: u64) -> CoreResult<()> {
        let size = backend.size()?;
        if size == expected {
            Ok(())
        } else {
            Err(CoreError::consistency(format!(
                "backup of {identity} has length {size}, expected {expected}"
            )))
        }
    }

    /// Mirrors one primary mutation.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if the backup file does not have the
    /// length the primary had before the mutation.
    pub(crate) fn apply(&mut self, item: &BackupItem) -> CoreResult<()> {
        match item {
            BackupItem::Write { identity, offset, data } => {
                let backend = self.backend(*identity)?;
                Self::expect_size(backend.as_ref(), *identity, *offset)?;
                backend.append(data)?;
                backend.flush()?;
            }
            BackupItem::Copy {
                source,
                offset,
                length,
                target,
                target_offset,
            } => {
                let backend = self.backend(*target)?;
                Self::expect_size(backend.as_ref(), *target, *target_offset)?;
                source.with_backend(|source| copy_range(&*source, *offset, *length, backend.as_mut()))?;
                backend.flush()?;
            }
            BackupItem::Truncate { identity, length } => {
                let backend = self.backend(*identity)?;
                let size = backend.size()?;
                if size < *length {
                    return Err(CoreError::consistency(format!(
                        "backup of {identity} has length {size}, cannot truncate to {length}"
                    )));
                }
                backend.truncate(*length)?;
                backend.sync()?;
            }
            BackupItem::Delete { identity } => self.delete(*identity)?,
        }
        Ok(())
    }

    fn delete(&mut self, identity: FileIdentity) -> CoreResult<()> {
        if !self.deletion_enabled {
            debug!(file = %identity, "keeping backup of deleted file");
            return Ok(());
        }
        self.open.remove(&identity);
        let path = self.layout.path(identity);
        let result = match &self.deletion_directory {
            Some(directory) => {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| identity.to_string());
                let mut target = directory.join(&name);
                if self.fs.exists(&target) {
                    target = directory.join(format!("{name}.{}", now_millis()));
                }
                self.fs.rename(&path, &target)
            }
            None => self.fs.delete(&path),
        };
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => Ok(other?),
        }
    }

    fn copy_file(&mut self, primary: &StorageLayout, identity: FileIdentity, from: u64, to: u64) -> CoreResult<()> {
        let source = self.fs.open(&primary.path(identity))?;
        let backend = self.backend(identity)?;
        copy_range(source.as_ref(), from, to - from, backend.as_mut())?;
        backend.sync()?;
        Ok(())
    }

    fn replace_file(&mut self, primary: &StorageLayout, identity: FileIdentity, size: u64) -> CoreResult<()> {
        self.backend(identity)?.truncate(0)?;
        self.copy_file(primary, identity, 0, size)
    }

    /// Brings the backup up to the state of the primary files before any
    /// channel starts writing.
    ///
    /// An empty backup receives a full copy. Otherwise missing data files
    /// are copied, the last data file both sides have is brought to the
    /// primary length and the transactions log is copied anew if its
    /// length differs. Any other length mismatch is an error.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if the backup does not belong to the
    /// primary files.
    pub(crate) fn synchronize(&mut self, primary: &StorageLayout, channel_count: usize) -> CoreResult<()> {
        for channel in 0..channel_count {
            let source = primary.inventory(self.fs.as_ref(), channel)?;
            let backup = self.layout.inventory(self.fs.as_ref(), channel)?;
            let last_common = source
                .data_files
                .keys()
                .rev()
                .find(|number| backup.data_files.contains_key(number))
                .copied();

            for (&number, &size) in &source.data_files {
                let identity = FileIdentity::data(channel, number);
                match backup.data_files.get(&number).copied() {
                    None => self.copy_file(primary, identity, 0, size)?,
                    Some(copied) if copied == size => {}
                    Some(copied) if Some(number) == last_common && copied < size => {
                        debug!(file = %identity, copied, size, "appending missing backup tail");
                        self.copy_file(primary, identity, copied, size)?;
                    }
                    Some(copied) if Some(number) == last_common => {
                        debug!(file = %identity, copied, size, "cutting backup to primary length");
                        let backend = self.backend(identity)?;
                        backend.truncate(size)?;
                        backend.sync()?;
                    }
                    Some(copied) => {
                        return Err(CoreError::consistency(format!(
                            "backup of {identity} has length {copied}, primary has {size}"
                        )))
                    }
                }
            }

            if let Some(size) = source.transactions_size {
                if backup.transactions_size != Some(size) {
                    self.replace_file(primary, FileIdentity::transactions(channel), size)?;
                }
            }
        }
        self.open.clear();
        info!(backup = %self.layout.base().display(), "backup synchronized");
        Ok(())
    }

    fn sync_all(&mut self) -> CoreResult<()> {
        for backend in self.open.values_mut() {
            backend.sync()?;
        }
        Ok(())
    }
}

/// Runs the backup thread.
///
/// Items are applied in enqueue order. After the first failure the backup
/// is out of step with the primary: the failure disrupts the storage and
/// later items are only released.
#[derive(Debug)]
pub(crate) struct BackupHandler {
    queue: Arc<BackupItemQueue>,
    failures: Arc<Mutex<Vec<Arc<CoreError>>>>,
    thread: Option<JoinHandle<()>>,
}

impl BackupHandler {
    /// Synchronizes `target` with `primary`, then starts the thread.
    ///
    /// # Errors
    ///
    /// Returns an error if synchronization fails or the thread cannot be
    /// spawned.
    pub(crate) fn start(
        mut target: BackupTarget,
        primary: &StorageLayout,
        channel_count: usize,
        poll_interval: Duration,
        controller: Arc<OperationController>,
    ) -> CoreResult<Self> {
        target.synchronize(primary, channel_count)?;
        let queue = Arc::new(BackupItemQueue::new());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let thread = {
            let queue = Arc::clone(&queue);
            let failures = Arc::clone(&failures);
            thread::Builder::new()
                .name("shardstore-backup".into())
                .spawn(move || run(target, &queue, poll_interval, &controller, &failures))?
        };
        Ok(Self {
            queue,
            failures,
            thread: Some(thread),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<BackupItemQueue> {
        &self.queue
    }

    /// Applies the remaining items and stops the thread.
    ///
    /// # Errors
    ///
    /// Returns every failure the thread recorded.
    pub(crate) fn shutdown(&mut self) -> CoreResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.queue.close();
        let mut collector = ErrorCollector::new();
        if thread.join().is_err() {
            collector.push(Arc::new(CoreError::consistency("backup thread panicked")));
        }
        for failure in self.failures.lock().drain(..) {
            collector.push(failure);
        }
        collector.finish("backup failed")
    }
}

impl Drop for BackupHandler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "backup stopped with failures");
        }
    }
}

fn run(
    mut target: BackupTarget,
    queue: &BackupItemQueue,
    poll_interval: Duration,
    controller: &OperationController,
    failures: &Mutex<Vec<Arc<CoreError>>>,
) {
    let mut failed = false;
    let record = |e: CoreError| {
        let e = Arc::new(e);
        error!(error = %e, "backup failed");
        failures.lock().push(Arc::clone(&e));
        controller.register_disruption(e);
    };
    loop {
        match queue.poll(poll_interval) {
            Some(item) => {
                if !failed {
                    if let Err(e) = target.apply(&item) {
                        failed = true;
                        record(e);
                    }
                }
                item.release();
            }
            None if queue.is_drained() => break,
            None => {}
        }
    }
    if let Err(e) = target.sync_all() {
        record(e);
    }
    debug!("backup thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileNaming;
    use crate::files::StoredFile;
    use bytes::Bytes;
    use shardstore_storage::InMemoryFileSystem;
    use std::path::Path;

    fn setup() -> (Arc<InMemoryFileSystem>, StorageLayout, BackupTarget) {
        let fs = Arc::new(InMemoryFileSystem::new());
        let primary = StorageLayout::new("/store", FileNaming::default());
        let target = BackupTarget::new(
            Arc::clone(&fs) as Arc<dyn FileSystem>,
            &primary,
            &BackupConfig::new("/backup").deletion_enabled(true),
        );
        (fs, primary, target)
    }

    fn backup_path(primary: &StorageLayout, identity: FileIdentity) -> PathBuf {
        primary.with_base("/backup").path(identity)
    }

    #[test]
    fn applies_items_in_order() {
        let (fs, primary, mut target) = setup();
        let one = FileIdentity::data(0, 1);
        let two = FileIdentity::data(0, 2);
        let source = Arc::new(StoredFile::open(fs.as_ref(), &primary, one).unwrap());
        source.with_backend(|backend| backend.append(b"0123456789")).unwrap();

        let items = [
            BackupItem::Write {
                identity: one,
                offset: 0,
                data: Bytes::from_static(b"0123456789"),
            },
            BackupItem::Copy {
                source: Arc::clone(&source),
                offset: 2,
                length: 3,
                target: two,
                target_offset: 0,
            },
            BackupItem::Truncate { identity: two, length: 2 },
        ];
        for item in &items {
            target.apply(item).unwrap();
        }
        assert_eq!(fs.read_all(&backup_path(&primary, one)).unwrap(), b"0123456789");
        assert_eq!(fs.read_all(&backup_path(&primary, two)).unwrap(), b"23");

        target.apply(&BackupItem::Delete { identity: one }).unwrap();
        assert!(!fs.exists(&backup_path(&primary, one)));
    }

    #[test]
    fn offset_mismatch_is_a_consistency_error() {
        let (_fs, _primary, mut target) = setup();
        let error = target
            .apply(&BackupItem::Write {
                identity: FileIdentity::data(0, 1),
                offset: 8,
                data: Bytes::from_static(b"late"),
            })
            .unwrap_err();
        assert!(error.is_consistency());
    }

    #[test]
    fn deletions_are_kept_unless_enabled() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let primary = StorageLayout::new("/store", FileNaming::default());
        let identity = FileIdentity::data(0, 1);
        fs.write_all(&backup_path(&primary, identity), b"x").unwrap();

        let mut keeping = BackupTarget::new(
            Arc::clone(&fs) as Arc<dyn FileSystem>,
            &primary,
            &BackupConfig::new("/backup"),
        );
        keeping.apply(&BackupItem::Delete { identity }).unwrap();
        assert!(fs.exists(&backup_path(&primary, identity)));

        let mut moving = BackupTarget::new(
            Arc::clone(&fs) as Arc<dyn FileSystem>,
            &primary,
            &BackupConfig::new("/backup")
                .deletion_enabled(true)
                .deletion_directory("/backup-deleted"),
        );
        moving.apply(&BackupItem::Delete { identity }).unwrap();
        assert!(fs.exists(Path::new("/backup-deleted/channel_0_1.dat")));
    }

    #[test]
    fn synchronization_copies_and_extends() {
        let (fs, primary, mut target) = setup();
        let (one, two, log) = (
            FileIdentity::data(0, 1),
            FileIdentity::data(0, 2),
            FileIdentity::transactions(0),
        );
        fs.write_all(&primary.path(one), b"first").unwrap();
        fs.write_all(&primary.path(two), b"second").unwrap();
        fs.write_all(&primary.path(log), b"log-v2").unwrap();

        // empty backup: full copy
        target.synchronize(&primary, 1).unwrap();
        for identity in [one, two, log] {
            assert_eq!(
                fs.read_all(&backup_path(&primary, identity)).unwrap(),
                fs.read_all(&primary.path(identity)).unwrap()
            );
        }

        // primary moved on: tail appended, log replaced
        fs.write_all(&primary.path(two), b"second+tail").unwrap();
        fs.write_all(&primary.path(log), b"log-version-3").unwrap();
        target.synchronize(&primary, 1).unwrap();
        assert_eq!(fs.read_all(&backup_path(&primary, two)).unwrap(), b"second+tail");
        assert_eq!(fs.read_all(&backup_path(&primary, log)).unwrap(), b"log-version-3");
    }

    #[test]
    fn synchronization_rejects_foreign_backups() {
        let (fs, primary, mut target) = setup();
        fs.write_all(&primary.path(FileIdentity::data(0, 1)), b"first").unwrap();
        fs.write_all(&primary.path(FileIdentity::data(0, 2)), b"second").unwrap();
        fs.write_all(&backup_path(&primary, FileIdentity::data(0, 1)), b"fir").unwrap();
        fs.write_all(&backup_path(&primary, FileIdentity::data(0, 2)), b"second").unwrap();

        let error = target.synchronize(&primary, 1).unwrap_err();
        assert!(error.is_consistency());
    }

    #[test]
    fn failures_disrupt_and_surface_on_shutdown() {
        let (_fs, primary, target) = setup();
        let controller = Arc::new(OperationController::new());
        controller.activate();
        let mut handler =
            BackupHandler::start(target, &primary, 1, Duration::from_millis(10), Arc::clone(&controller)).unwrap();
        handler.queue().enqueue(BackupItem::Write {
            identity: FileIdentity::data(0, 1),
            offset: 100,
            data: Bytes::from_static(b"x"),
        });

        let error = handler.shutdown().unwrap_err();
        assert!(matches!(error, CoreError::MultiCause { .. }));
        assert!(controller.has_disruptions());
        assert!(!controller.is_running());
        handler.shutdown().unwrap();
    }
}
