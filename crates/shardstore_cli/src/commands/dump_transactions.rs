//! Dump transactions command implementation.

use super::{CliError, StorageDirectory};
use crate::Format;
use serde::Serialize;
use shardstore_core::{EntryIter, TransactionEntry};
use std::path::Path;

/// A log entry with its position.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Offset in the log.
    pub offset: u64,
    /// The decoded entry.
    pub entry: TransactionEntry,
}

/// Runs the dump-transactions command.
pub fn run(path: &Path, channel: usize, limit: Option<usize>, format: Format) -> Result<(), CliError> {
    let (entries, trailing) = read_entries(path, channel, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => print_text_output(&entries, trailing),
    }
    Ok(())
}

/// Decodes up to `limit` entries; also returns the length of a trailing
/// partial entry.
pub fn read_entries(path: &Path, channel: usize, limit: Option<usize>) -> Result<(Vec<EntryInfo>, u64), CliError> {
    let directory = StorageDirectory::open(path)?;
    directory.require(channel)?;
    let Some(bytes) = directory.transactions(channel)? else {
        return Ok((Vec::new(), 0));
    };

    let mut entries = Vec::new();
    let mut iter = EntryIter::new(&bytes);
    for entry in iter.by_ref().take(limit.unwrap_or(usize::MAX)) {
        let (offset, entry) = entry?;
        entries.push(EntryInfo { offset, entry });
    }
    let trailing = if limit.map_or(true, |limit| entries.len() < limit) {
        (bytes.len() - iter.consumed()) as u64
    } else {
        0
    };
    Ok((entries, trailing))
}

fn print_text_output(entries: &[EntryInfo], trailing: u64) {
    println!("{:>10}  {:<14} {:>20}  {:>12}  details", "offset", "type", "timestamp", "length");
    for info in entries {
        let (kind, details) = match info.entry {
            TransactionEntry::FileCreation { file_number, .. } => ("creation", format!("file {file_number}")),
            TransactionEntry::Store { .. } => ("store", String::new()),
            TransactionEntry::Transfer {
                source_file_number,
                source_offset,
                ..
            } => ("transfer", format!("from file {source_file_number} at {source_offset}")),
            TransactionEntry::FileTruncation {
                file_number,
                old_length,
                ..
            } => ("truncation", format!("file {file_number} from {old_length}")),
            TransactionEntry::FileDeletion { file_number, .. } => ("deletion", format!("file {file_number}")),
        };
        println!(
            "{:>10}  {:<14} {:>20}  {:>12}  {details}",
            info.offset,
            kind,
            info.entry.timestamp(),
            info.entry.file_length()
        );
    }
    println!();
    println!("{} entries", entries.len());
    if trailing > 0 {
        println!("{trailing} bytes of a partial entry at the end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::write_storage;

    #[test]
    fn reads_entries_with_offsets() {
        let temp = tempfile::tempdir().unwrap();
        let length = write_storage(temp.path());
        let (entries, trailing) = read_entries(temp.path(), 0, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].offset, 26);
        assert_eq!(entries[1].entry.file_length(), length);
        assert_eq!(trailing, 0);

        let (limited, _) = read_entries(temp.path(), 0, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
