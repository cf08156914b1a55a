//! Pending backup work.

use crate::files::{FileIdentity, FileUser, StoredFile};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A primary file mutation still to be mirrored.
#[derive(Debug, Clone)]
pub(crate) enum BackupItem {
    /// `data` was appended to the file at `offset`.
    Write {
        identity: FileIdentity,
        offset: u64,
        data: Bytes,
    },
    /// A range of `source` was appended to `target` at `target_offset`.
    /// The source stays pinned until the item is applied.
    Copy {
        source: Arc<StoredFile>,
        offset: u64,
        length: u64,
        target: FileIdentity,
        target_offset: u64,
    },
    /// The file was cut down to `length`.
    Truncate { identity: FileIdentity, length: u64 },
    /// The file was deleted.
    Delete { identity: FileIdentity },
}

impl BackupItem {
    /// The primary file the backup thread still needs to read.
    fn pinned(&self) -> Option<&Arc<StoredFile>> {
        match self {
            Self::Copy { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Releases the pin taken at enqueue.
    pub(crate) fn release(&self) {
        if let Some(file) = self.pinned() {
            file.release_user(FileUser::Backup);
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<BackupItem>,
    closed: bool,
}

/// Unbounded FIFO between the channel threads and the backup thread.
#[derive(Debug, Default)]
pub(crate) struct BackupItemQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl BackupItemQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an item, pinning the file it reads from.
    pub(crate) fn enqueue(&self, item: BackupItem) {
        if let Some(file) = item.pinned() {
            file.register_user(FileUser::Backup);
        }
        self.state.lock().items.push_back(item);
        self.available.notify_one();
    }

    /// Takes the oldest item, waiting up to `timeout` for one unless the
    /// queue is closed.
    pub(crate) fn poll(&self, timeout: Duration) -> Option<BackupItem> {
        let mut state = self.state.lock();
        if state.items.is_empty() && !state.closed {
            self.available.wait_for(&mut state, timeout);
        }
        state.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true once [`close`](Self::close) was called and every item
    /// was taken.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    /// Stops waiting in [`poll`](Self::poll). Remaining items can still be
    /// taken.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }
}
