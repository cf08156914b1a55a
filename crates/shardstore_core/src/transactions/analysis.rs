//! Replay of a transactions log.

use super::entry::{EntryIter, TransactionEntry};
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// What the log says about one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoggedFile {
    /// File number.
    pub number: u64,
    /// Length after the last logged event.
    pub length: u64,
    /// Whether a deletion was logged.
    pub deleted: bool,
}

/// The state of a channel's files as recorded by its transactions log.
///
/// Besides the per-file lengths, the analysis keeps two points of the head
/// file's history: the latest store and the store before it ("last
/// consistent"). A crash in the middle of a store leaves some channels with
/// the new store logged and others without; at startup every channel rolls
/// back to the newest store all channels have, see
/// [`TransactionsAnalysis::consistent_head_length`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionsAnalysis {
    files: BTreeMap<u64, LoggedFile>,
    head_file_number: Option<u64>,
    max_file_number: u64,
    head_latest_timestamp: i64,
    head_latest_length: u64,
    last_consistent_timestamp: i64,
    last_consistent_length: u64,
    max_timestamp: i64,
    entry_count: usize,
    consumed_length: u64,
}

impl TransactionsAnalysis {
    /// Replays an encoded log.
    ///
    /// # Errors
    ///
    /// Returns a consistency error for undecodable entries and for entries
    /// contradicting the preceding ones.
    pub fn analyze(bytes: &[u8]) -> CoreResult<Self> {
        let mut analysis = Self::default();
        let mut entries = EntryIter::new(bytes);
        for item in entries.by_ref() {
            let (offset, entry) = item?;
            analysis
                .apply(&entry)
                .map_err(|e| CoreError::consistency(format!("transactions entry at {offset}: {e}")))?;
        }
        analysis.consumed_length = entries.consumed() as u64;
        Ok(analysis)
    }

    /// Replays a sequence of decoded entries.
    ///
    /// # Errors
    ///
    /// Returns a consistency error for contradicting entries.
    pub fn from_entries(entries: &[TransactionEntry]) -> CoreResult<Self> {
        let mut analysis = Self::default();
        for entry in entries {
            analysis.apply(entry)?;
        }
        Ok(analysis)
    }

    fn head(&self, entry: &TransactionEntry) -> CoreResult<u64> {
        self.head_file_number.ok_or_else(|| {
            CoreError::consistency(format!("{entry:?} before any file creation"))
        })
    }

    fn apply(&mut self, entry: &TransactionEntry) -> CoreResult<()> {
        self.entry_count += 1;
        self.max_timestamp = self.max_timestamp.max(entry.timestamp());
        match *entry {
            TransactionEntry::FileCreation {
                file_length,
                file_number,
                ..
            } => {
                if !self.files.is_empty() && file_number <= self.max_file_number {
                    return Err(CoreError::consistency(format!(
                        "file {file_number} created after file {}",
                        self.max_file_number
                    )));
                }
                self.files.insert(
                    file_number,
                    LoggedFile {
                        number: file_number,
                        length: file_length,
                        deleted: false,
                    },
                );
                self.max_file_number = file_number;
                self.head_file_number = Some(file_number);
                self.last_consistent_timestamp = self.head_latest_timestamp;
                self.last_consistent_length = file_length;
                self.head_latest_length = file_length;
            }
            TransactionEntry::Store {
                timestamp,
                file_length,
            } => {
                let head = self.head(entry)?;
                if file_length < self.head_latest_length {
                    return Err(CoreError::consistency(format!(
                        "store shrinks file {head} from {} to {file_length}",
                        self.head_latest_length
                    )));
                }
                if timestamp <= self.head_latest_timestamp {
                    return Err(CoreError::consistency(format!(
                        "store timestamp {timestamp} not after {}",
                        self.head_latest_timestamp
                    )));
                }
                self.last_consistent_timestamp = self.head_latest_timestamp;
                self.last_consistent_length = self.head_latest_length;
                self.head_latest_timestamp = timestamp;
                self.set_head_length(head, file_length);
            }
            TransactionEntry::Transfer {
                file_length,
                source_file_number,
                ..
            } => {
                let head = self.head(entry)?;
                if file_length < self.head_latest_length {
                    return Err(CoreError::consistency(format!(
                        "transfer shrinks file {head} from {} to {file_length}",
                        self.head_latest_length
                    )));
                }
                match self.files.get(&source_file_number) {
                    Some(source) if !source.deleted && source_file_number != head => {}
                    _ => {
                        return Err(CoreError::consistency(format!(
                            "transfer from unknown file {source_file_number}"
                        )))
                    }
                }
                self.last_consistent_length = file_length;
                self.set_head_length(head, file_length);
            }
            TransactionEntry::FileTruncation {
                file_length,
                file_number,
                ..
            } => {
                let head = self.head(entry)?;
                if file_number != head {
                    return Err(CoreError::consistency(format!(
                        "truncation of file {file_number} which is not the head file {head}"
                    )));
                }
                if file_length > self.head_latest_length {
                    return Err(CoreError::consistency(format!(
                        "truncation of file {head} to {file_length} beyond its length {}",
                        self.head_latest_length
                    )));
                }
                self.last_consistent_length = file_length;
                self.set_head_length(head, file_length);
            }
            TransactionEntry::FileDeletion { file_number, .. } => {
                match self.files.get_mut(&file_number) {
                    Some(file) if !file.deleted => file.deleted = true,
                    _ => {
                        return Err(CoreError::consistency(format!(
                            "deletion of unknown file {file_number}"
                        )))
                    }
                }
                if self.head_file_number == Some(file_number) {
                    // an aborted import: the previous head takes over again
                    let previous = self.files.values().rev().find(|file| !file.deleted).copied();
                    self.head_file_number = previous.map(|file| file.number);
                    let length = previous.map_or(0, |file| file.length);
                    self.head_latest_length = length;
                    self.last_consistent_length = length;
                }
            }
        }
        Ok(())
    }

    fn set_head_length(&mut self, head: u64, length: u64) {
        self.head_latest_length = length;
        if let Some(file) = self.files.get_mut(&head) {
            file.length = length;
        }
    }

    /// Returns true if the log contained no complete entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Every file the log knows, by number.
    #[must_use]
    pub fn files(&self) -> &BTreeMap<u64, LoggedFile> {
        &self.files
    }

    /// The file stores currently go to.
    #[must_use]
    pub const fn head_file_number(&self) -> Option<u64> {
        self.head_file_number
    }

    /// Highest file number ever created.
    #[must_use]
    pub const fn max_file_number(&self) -> u64 {
        self.max_file_number
    }

    /// Timestamp of the latest store (0 if none).
    #[must_use]
    pub const fn head_latest_timestamp(&self) -> i64 {
        self.head_latest_timestamp
    }

    /// Head file length after the latest event.
    #[must_use]
    pub const fn head_latest_length(&self) -> u64 {
        self.head_latest_length
    }

    /// Timestamp of the store before the latest one.
    #[must_use]
    pub const fn last_consistent_timestamp(&self) -> i64 {
        self.last_consistent_timestamp
    }

    /// Head file length before the latest store.
    #[must_use]
    pub const fn last_consistent_length(&self) -> u64 {
        self.last_consistent_length
    }

    /// Highest timestamp of any entry.
    #[must_use]
    pub const fn max_timestamp(&self) -> i64 {
        self.max_timestamp
    }

    /// Number of entries replayed.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Length of the complete entries; a partial entry follows if the log
    /// is longer.
    #[must_use]
    pub const fn consumed_length(&self) -> u64 {
        self.consumed_length
    }

    /// The head file length belonging to the store at `consistent_timestamp`,
    /// the newest store every channel has logged.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if neither of the two tracked stores
    /// matches the timestamp: the channel would have to roll back further
    /// than one store.
    pub fn consistent_head_length(&self, consistent_timestamp: i64) -> CoreResult<u64> {
        if self.head_latest_timestamp == consistent_timestamp {
            Ok(self.head_latest_length)
        } else if self.last_consistent_timestamp == consistent_timestamp {
            Ok(self.last_consistent_length)
        } else {
            Err(CoreError::consistency(format!(
                "no store at timestamp {consistent_timestamp}: latest {}, previous {}",
                self.head_latest_timestamp, self.last_consistent_timestamp
            )))
        }
    }
}
