//! A channel's open transactions log.

use super::entry::TransactionEntry;
use crate::error::CoreResult;
use crate::files::StoredFile;
use crate::writer::{self, StorageWriter};
use std::sync::Arc;

/// Append-only writer of a channel's transactions log.
///
/// Entries are synced before the call returns: an operation is only
/// applied after its entry is durable, and a store is only acknowledged
/// after its entry is durable.
#[derive(Debug)]
pub struct TransactionsLog {
    file: Arc<StoredFile>,
    writer: Arc<dyn StorageWriter>,
    length: u64,
}

impl TransactionsLog {
    /// Wraps an open log whose content is `length` bytes.
    #[must_use]
    pub fn new(file: Arc<StoredFile>, writer: Arc<dyn StorageWriter>, length: u64) -> Self {
        Self { file, writer, length }
    }

    /// The underlying file.
    #[must_use]
    pub fn file(&self) -> &Arc<StoredFile> {
        &self.file
    }

    /// Current log length.
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Appends and syncs one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn append(&mut self, entry: &TransactionEntry) -> CoreResult<()> {
        self.append_all(&entry.encode())
    }

    /// Appends and syncs pre-encoded entries.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn append_all(&mut self, bytes: &[u8]) -> CoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.writer.append(&self.file, bytes)?;
        writer::sync(&self.file)?;
        self.length += bytes.len() as u64;
        Ok(())
    }

    /// Cuts off a partial entry left by a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    pub fn truncate_to(&mut self, length: u64) -> CoreResult<()> {
        if length < self.length {
            self.writer.truncate(&self.file, length)?;
            self.length = length;
        }
        Ok(())
    }

    /// Replaces the whole content with `bytes`.
    ///
    /// The log is emptied first: a crash before the new content is written
    /// leaves an empty log, which is rebuilt from the data files at the next
    /// start.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn rewrite(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.writer.truncate(&self.file, 0)?;
        self.length = 0;
        self.append_all(bytes)
    }
}
