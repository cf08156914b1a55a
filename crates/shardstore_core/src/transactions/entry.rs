//! Transactions log entry encoding.
//!
//! ```text
//! [entry_length: u8][type: u8][timestamp: i64][file_length: i64][extra fields...]
//! ```
//!
//! All values are little endian. `file_length` is the length of the
//! affected file after the operation.

use crate::binary::ByteReader;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;

const TAG_FILE_CREATION: u8 = 0;
const TAG_STORE: u8 = 1;
const TAG_TRANSFER: u8 = 2;
const TAG_FILE_TRUNCATION: u8 = 3;
const TAG_FILE_DELETION: u8 = 4;

const BASE_LENGTH: u8 = 18;

/// One event of a channel's transactions log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEntry {
    /// A data file was created (or adopted with the given length).
    FileCreation {
        /// Event time in nanoseconds.
        timestamp: i64,
        /// Length of the new file.
        file_length: u64,
        /// Number of the new file.
        file_number: u64,
    },
    /// Entity data was appended to the head file.
    Store {
        /// Store timestamp, shared by all channels for one store.
        timestamp: i64,
        /// Head file length after the store.
        file_length: u64,
    },
    /// Live entities were copied from another file to the head file.
    Transfer {
        /// Event time in nanoseconds.
        timestamp: i64,
        /// Head file length after the transfer.
        file_length: u64,
        /// File the entities were copied from.
        source_file_number: u64,
        /// Offset of the copied range in the source file.
        source_offset: u64,
    },
    /// A data file was cut down.
    FileTruncation {
        /// Event time in nanoseconds.
        timestamp: i64,
        /// Length after truncation.
        file_length: u64,
        /// Truncated file.
        file_number: u64,
        /// Length before truncation.
        old_length: u64,
    },
    /// A data file was deleted.
    FileDeletion {
        /// Event time in nanoseconds.
        timestamp: i64,
        /// Length of the file when it was deleted.
        file_length: u64,
        /// Deleted file.
        file_number: u64,
    },
}

impl TransactionEntry {
    /// Encoded length of an entry with the given tag, or `None` for an
    /// unknown tag.
    const fn length_of(tag: u8) -> Option<u8> {
        match tag {
            TAG_STORE => Some(BASE_LENGTH),
            TAG_FILE_CREATION | TAG_FILE_DELETION => Some(BASE_LENGTH + 8),
            TAG_TRANSFER | TAG_FILE_TRUNCATION => Some(BASE_LENGTH + 16),
            _ => None,
        }
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::FileCreation { .. } => TAG_FILE_CREATION,
            Self::Store { .. } => TAG_STORE,
            Self::Transfer { .. } => TAG_TRANSFER,
            Self::FileTruncation { .. } => TAG_FILE_TRUNCATION,
            Self::FileDeletion { .. } => TAG_FILE_DELETION,
        }
    }

    /// Event timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        match *self {
            Self::FileCreation { timestamp, .. }
            | Self::Store { timestamp, .. }
            | Self::Transfer { timestamp, .. }
            | Self::FileTruncation { timestamp, .. }
            | Self::FileDeletion { timestamp, .. } => timestamp,
        }
    }

    /// File length after the event.
    #[must_use]
    pub const fn file_length(&self) -> u64 {
        match *self {
            Self::FileCreation { file_length, .. }
            | Self::Store { file_length, .. }
            | Self::Transfer { file_length, .. }
            | Self::FileTruncation { file_length, .. }
            | Self::FileDeletion { file_length, .. } => file_length,
        }
    }

    /// Appends the encoded entry to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let tag = self.tag();
        // every tag produced by `tag()` has a length
        let length = Self::length_of(tag).unwrap_or(BASE_LENGTH);
        out.push(length);
        out.push(tag);
        out.extend_from_slice(&self.timestamp().to_le_bytes());
        out.extend_from_slice(&(self.file_length() as i64).to_le_bytes());
        let mut field = |value: u64| out.extend_from_slice(&(value as i64).to_le_bytes());
        match *self {
            Self::Store { .. } => {}
            Self::FileCreation { file_number, .. } | Self::FileDeletion { file_number, .. } => field(file_number),
            Self::Transfer {
                source_file_number,
                source_offset,
                ..
            } => {
                field(source_file_number);
                field(source_offset);
            }
            Self::FileTruncation {
                file_number,
                old_length,
                ..
            } => {
                field(file_number);
                field(old_length);
            }
        }
    }

    /// Encodes the entry into a new buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_LENGTH as usize + 16);
        self.encode_into(&mut out);
        out
    }

    fn decode(tag: u8, offset: u64, reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let timestamp = reader.read_i64()?;
        let file_length = non_negative(reader.read_i64()?, "file length", offset)?;
        let mut field = |name: &str| -> CoreResult<u64> { non_negative(reader.read_i64()?, name, offset) };
        Ok(match tag {
            TAG_FILE_CREATION => Self::FileCreation {
                timestamp,
                file_length,
                file_number: field("file number")?,
            },
            TAG_STORE => Self::Store {
                timestamp,
                file_length,
            },
            TAG_TRANSFER => Self::Transfer {
                timestamp,
                file_length,
                source_file_number: field("source file number")?,
                source_offset: field("source offset")?,
            },
            TAG_FILE_TRUNCATION => Self::FileTruncation {
                timestamp,
                file_length,
                file_number: field("file number")?,
                old_length: field("old length")?,
            },
            TAG_FILE_DELETION => Self::FileDeletion {
                timestamp,
                file_length,
                file_number: field("file number")?,
            },
            _ => return Err(CoreError::consistency(format!("unknown entry type {tag} at {offset}"))),
        })
    }
}

fn non_negative(value: i64, name: &str, offset: u64) -> CoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| CoreError::consistency(format!("negative {name} {value} in entry at {offset}")))
}

/// Iterates over the entries of a transactions log.
///
/// Yields each entry with its offset. A partial entry at the end, left by a
/// crash during an append, ends iteration without an error.
#[derive(Debug, Clone)]
pub struct EntryIter<'a> {
    bytes: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> EntryIter<'a> {
    /// Creates an iterator over a whole log.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            failed: false,
        }
    }

    /// Length of the complete entries read so far.
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.position
    }
}

impl Iterator for EntryIter<'_> {
    type Item = CoreResult<(u64, TransactionEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.position..];
        if self.failed || rest.len() < 2 {
            return None;
        }

        let offset = self.position as u64;
        let (length, tag) = (rest[0], rest[1]);
        let expected = match TransactionEntry::length_of(tag) {
            Some(expected) if expected == length => expected as usize,
            Some(expected) => {
                self.failed = true;
                return Some(Err(CoreError::consistency(format!(
                    "entry at {offset} of type {tag} has length {length}, expected {expected}"
                ))));
            }
            None => {
                self.failed = true;
                return Some(Err(CoreError::consistency(format!(
                    "unknown entry type {tag} at {offset}"
                ))));
            }
        };
        if rest.len() < expected {
            return None;
        }

        let mut reader = ByteReader::new(&rest[2..expected]);
        match TransactionEntry::decode(tag, offset, &mut reader) {
            Ok(entry) => {
                self.position += expected;
                Some(Ok((offset, entry)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Encodes a sequence of entries.
#[must_use]
pub fn encode_all(entries: &[TransactionEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        entry.encode_into(&mut out);
    }
    out
}
