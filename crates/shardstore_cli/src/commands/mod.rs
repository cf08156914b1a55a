//! CLI command implementations.

pub mod dump_transactions;
pub mod inspect;
pub mod verify;

use shardstore_core::{FileNaming, StorageLayout, TransactionsAnalysis};
use shardstore_storage::{FileSystem, LocalFileSystem};
use std::path::Path;
use thiserror::Error;

/// Errors reported by the commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory holds no channel directories.
    #[error("no storage found at {0}")]
    NoStorage(String),

    /// The requested channel does not exist.
    #[error("channel {channel} not found, the storage has {count}")]
    NoSuchChannel {
        /// Requested channel.
        channel: usize,
        /// Channels present.
        count: usize,
    },

    /// Verification found problems.
    #[error("verification found {0} problem(s)")]
    VerificationFailed(usize),

    /// Reading the storage failed.
    #[error(transparent)]
    Core(#[from] shardstore_core::CoreError),

    /// Report serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// File access failed.
    #[error(transparent)]
    Storage(#[from] shardstore_storage::StorageError),
}

/// A storage directory opened for reading.
pub struct StorageDirectory {
    /// File access.
    pub fs: LocalFileSystem,
    /// Names below the directory.
    pub layout: StorageLayout,
    /// Channel indexes found, ascending.
    pub channels: Vec<usize>,
}

impl StorageDirectory {
    /// Finds the channel directories below `path`.
    pub fn open(path: &Path) -> Result<Self, CliError> {
        let fs = LocalFileSystem::new();
        let naming = FileNaming::default();
        let layout = StorageLayout::new(path, naming.clone());
        let mut channels: Vec<usize> = fs
            .list_dirs(path)?
            .iter()
            .filter_map(|dir| dir.file_name()?.to_str()?.strip_prefix(&naming.channel_directory_prefix)?.parse().ok())
            .collect();
        channels.sort_unstable();
        if channels.is_empty() {
            return Err(CliError::NoStorage(path.display().to_string()));
        }
        Ok(Self { fs, layout, channels })
    }

    /// Checks that `channel` exists.
    pub fn require(&self, channel: usize) -> Result<(), CliError> {
        if self.channels.contains(&channel) {
            Ok(())
        } else {
            Err(CliError::NoSuchChannel {
                channel,
                count: self.channels.len(),
            })
        }
    }

    /// Reads a channel's transactions log, if present.
    pub fn transactions(&self, channel: usize) -> Result<Option<Vec<u8>>, CliError> {
        let path = self.layout.path(shardstore_core::FileIdentity::transactions(channel));
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        Ok(Some(self.fs.read_all(&path)?))
    }

    /// Replays a channel's transactions log, if present.
    pub fn analysis(&self, channel: usize) -> Result<Option<TransactionsAnalysis>, CliError> {
        match self.transactions(channel)? {
            Some(bytes) => Ok(Some(TransactionsAnalysis::analyze(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use shardstore_core::{
        encode_entity, encode_gap, FileIdentity, FileNaming, ObjectId, StorageLayout, TransactionEntry, TypeId,
    };
    use shardstore_storage::{FileSystem, LocalFileSystem};
    use std::path::Path;

    /// Writes a one-channel storage with one data file holding two
    /// entities and a gap, and a matching log.
    pub(crate) fn write_storage(path: &Path) -> u64 {
        let fs = LocalFileSystem::new();
        let layout = StorageLayout::new(path, FileNaming::default());
        let mut data = encode_entity(TypeId(1), ObjectId(1), b"first");
        data.extend(encode_gap(16));
        data.extend(encode_entity(TypeId(2), ObjectId(2), b"second"));
        let length = data.len() as u64;
        fs.write_all(&layout.path(FileIdentity::data(0, 1)), &data).unwrap();

        let log: Vec<u8> = [
            TransactionEntry::FileCreation {
                timestamp: 1,
                file_length: 0,
                file_number: 1,
            },
            TransactionEntry::Store {
                timestamp: 2,
                file_length: length,
            },
        ]
        .iter()
        .flat_map(TransactionEntry::encode)
        .collect();
        fs.write_all(&layout.path(FileIdentity::transactions(0)), &log).unwrap();
        length
    }

    #[test]
    fn finds_channel_directories() {
        let temp = tempfile::tempdir().unwrap();
        write_storage(temp.path());
        let directory = super::StorageDirectory::open(temp.path()).unwrap();
        assert_eq!(directory.channels, vec![0]);
        assert!(directory.require(1).is_err());
        assert!(directory.analysis(0).unwrap().is_some());
    }

    #[test]
    fn empty_directory_is_not_a_storage() {
        let temp = tempfile::tempdir().unwrap();
        assert!(super::StorageDirectory::open(temp.path()).is_err());
    }
}
