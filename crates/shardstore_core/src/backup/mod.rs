//! Continuous backup of the channel files.
//!
//! A [`BackupWriter`] wraps the writer the channels use. After each
//! primary mutation it enqueues an item describing it; a single backup
//! thread applies the items in order to the same file layout below the
//! backup directory. Appended data travels with its item, so later
//! truncations of the primary cannot affect it. Transfers read their
//! source when applied; the source stays pinned until then.
//!
//! Before the channels start, the backup is synchronized with the
//! primary files (see [`BackupTarget::synchronize`]).

mod handler;
mod queue;

pub(crate) use handler::{BackupHandler, BackupTarget};
pub(crate) use queue::{BackupItem, BackupItemQueue};

use crate::error::CoreResult;
use crate::files::StoredFile;
use crate::writer::StorageWriter;
use bytes::Bytes;
use std::sync::Arc;

/// Writes through `inner` and mirrors every mutation to the backup queue.
#[derive(Debug)]
pub(crate) struct BackupWriter {
    inner: Arc<dyn StorageWriter>,
    queue: Arc<BackupItemQueue>,
}

impl BackupWriter {
    pub(crate) fn new(inner: Arc<dyn StorageWriter>, queue: Arc<BackupItemQueue>) -> Self {
        Self { inner, queue }
    }
}

impl StorageWriter for BackupWriter {
    fn append(&self, file: &Arc<StoredFile>, data: &[u8]) -> CoreResult<u64> {
        let offset = self.inner.append(file, data)?;
        self.queue.enqueue(BackupItem::Write {
            identity: file.identity(),
            offset,
            data: Bytes::copy_from_slice(data),
        });
        Ok(offset)
    }

    fn copy(&self, source: &Arc<StoredFile>, offset: u64, len: u64, target: &Arc<StoredFile>) -> CoreResult<u64> {
        let target_offset = self.inner.copy(source, offset, len, target)?;
        self.queue.enqueue(BackupItem::Copy {
            source: Arc::clone(source),
            offset,
            length: len,
            target: target.identity(),
            target_offset,
        });
        Ok(target_offset)
    }

    fn truncate(&self, file: &Arc<StoredFile>, new_length: u64) -> CoreResult<()> {
        self.inner.truncate(file, new_length)?;
        self.queue.enqueue(BackupItem::Truncate {
            identity: file.identity(),
            length: new_length,
        });
        Ok(())
    }

    fn delete(&self, file: &Arc<StoredFile>) -> CoreResult<()> {
        self.inner.delete(file)?;
        self.queue.enqueue(BackupItem::Delete {
            identity: file.identity(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, FileNaming};
    use crate::controller::OperationController;
    use crate::files::{FileIdentity, FileUser, StorageLayout};
    use crate::writer::DefaultWriter;
    use shardstore_storage::{FileSystem, InMemoryFileSystem};
    use std::time::Duration;

    #[test]
    fn backup_mirrors_every_write() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let dyn_fs = Arc::clone(&fs) as Arc<dyn FileSystem>;
        let primary = StorageLayout::new("/store", FileNaming::default());
        let config = BackupConfig::new("/backup").deletion_enabled(true);
        let controller = Arc::new(OperationController::new());
        controller.activate();

        let target = BackupTarget::new(Arc::clone(&dyn_fs), &primary, &config);
        let mut handler = BackupHandler::start(target, &primary, 1, Duration::from_millis(10), controller).unwrap();
        let writer = BackupWriter::new(
            Arc::new(DefaultWriter::new(Arc::clone(&dyn_fs), None, None)),
            Arc::clone(handler.queue()),
        );

        let open = |identity| Arc::new(StoredFile::open(fs.as_ref(), &primary, identity).unwrap());
        let old = open(FileIdentity::data(0, 1));
        let head = open(FileIdentity::data(0, 2));
        let log = open(FileIdentity::transactions(0));

        writer.append(&old, b"aaaabbbb").unwrap();
        writer.append(&log, b"entry").unwrap();
        writer.copy(&old, 4, 4, &head).unwrap();
        writer.append(&head, b"cccc").unwrap();
        writer.truncate(&head, 6).unwrap();
        writer.delete(&old).unwrap();
        old.release_user(FileUser::Channel);

        handler.shutdown().unwrap();
        let mirror = primary.with_base("/backup");
        for identity in [FileIdentity::data(0, 2), FileIdentity::transactions(0)] {
            assert_eq!(
                fs.read_all(&mirror.path(identity)).unwrap(),
                fs.read_all(&primary.path(identity)).unwrap()
            );
        }
        assert_eq!(fs.read_all(&mirror.path(FileIdentity::data(0, 2))).unwrap(), b"bbbbcc");
        assert!(!fs.exists(&mirror.path(FileIdentity::data(0, 1))));
        assert!(!old.has_foreign_users());
    }
}
