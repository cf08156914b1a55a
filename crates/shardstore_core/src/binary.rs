//! Bounds-checked binary access and the entity record layout.
//!
//! Entity records are stored back to back in data files:
//!
//! ```text
//! [length: i64 LE][type_id: u64 LE][object_id: u64 LE][content ...]
//! ```
//!
//! `length` covers the whole record including the 24 header bytes. A
//! negative length marks a gap of `-length` bytes that must be skipped.
//! A zero length can never be produced by a writer and is always a
//! consistency error, since iteration could not advance past it.

use crate::error::{CoreError, CoreResult};
use crate::types::{ObjectId, TypeId};

/// Size of an entity record header.
pub const ENTITY_HEADER_LENGTH: u64 = 24;

/// Smallest gap that can be written (the length field alone).
pub const MIN_GAP_LENGTH: u64 = 8;

/// A cursor over a byte slice that reports out-of-range access as an error.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader at the start of `bytes`.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Current read position.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Returns the next `len` bytes and advances past them.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if fewer than `len` bytes remain.
    pub fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CoreError::consistency(format!(
                "read of {len} bytes at {} exceeds buffer of {} bytes",
                self.position,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns a consistency error at the end of the buffer.
    pub fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Reads a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if fewer than 8 bytes remain.
    pub fn read_i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if fewer than 8 bytes remain.
    pub fn read_u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }
}

/// Reads a little-endian `u64` at `offset` of `bytes`.
///
/// # Errors
///
/// Returns a consistency error if the 8 bytes are out of range.
pub fn u64_at(bytes: &[u8], offset: usize) -> CoreResult<u64> {
    let end = offset.checked_add(8).filter(|end| *end <= bytes.len());
    match end {
        Some(end) => {
            let mut array = [0u8; 8];
            array.copy_from_slice(&bytes[offset..end]);
            Ok(u64::from_le_bytes(array))
        }
        None => Err(CoreError::consistency(format!(
            "8-byte value at {offset} exceeds record of {} bytes",
            bytes.len()
        ))),
    }
}

/// The decoded header of an entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHeader {
    /// Total record length including the header.
    pub length: u64,
    /// Type of the entity.
    pub type_id: TypeId,
    /// Identity of the entity.
    pub object_id: ObjectId,
}

impl EntityHeader {
    /// Length of the content following the header.
    #[must_use]
    pub const fn content_length(&self) -> u64 {
        self.length - ENTITY_HEADER_LENGTH
    }
}

/// What a length-prefixed region turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A live or superseded entity record.
    Entity(EntityHeader),
    /// Dead space of the given total length.
    Gap(u64),
}

/// A record found while scanning a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Offset of the record, relative to the scanned buffer plus its base.
    pub offset: u64,
    /// Decoded record kind.
    pub kind: RecordKind,
}

impl Record {
    /// Length of the record in bytes.
    #[must_use]
    pub const fn length(&self) -> u64 {
        match self.kind {
            RecordKind::Entity(header) => header.length,
            RecordKind::Gap(length) => length,
        }
    }
}

/// Decodes the header of the record starting at the front of `bytes`.
///
/// # Errors
///
/// Returns a consistency error for a zero length, an entity length smaller
/// than the header, a gap shorter than [`MIN_GAP_LENGTH`], or a truncated
/// header.
pub fn decode_header(bytes: &[u8]) -> CoreResult<RecordKind> {
    let mut reader = ByteReader::new(bytes);
    let length = reader.read_i64()?;
    if length == 0 {
        return Err(CoreError::consistency("zero length record"));
    }
    if length < 0 {
        let gap = length.unsigned_abs();
        if gap < MIN_GAP_LENGTH {
            return Err(CoreError::consistency(format!("gap of {gap} bytes is too short")));
        }
        return Ok(RecordKind::Gap(gap));
    }

    let length = length as u64;
    if length < ENTITY_HEADER_LENGTH {
        return Err(CoreError::consistency(format!(
            "entity length {length} is smaller than its header"
        )));
    }
    let type_id = TypeId(reader.read_u64()?);
    let object_id = ObjectId(reader.read_u64()?);
    Ok(RecordKind::Entity(EntityHeader {
        length,
        type_id,
        object_id,
    }))
}

/// Iterates over the records of a buffer holding whole records.
///
/// A record reaching past the end of the buffer is reported as a
/// consistency error, as is every header error of [`decode_header`].
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    base: u64,
    position: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    /// Creates an iterator over `bytes`; reported offsets start at `base`.
    #[must_use]
    pub const fn new(bytes: &'a [u8], base: u64) -> Self {
        Self {
            bytes,
            base,
            position: 0,
            failed: false,
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = CoreResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.bytes.len() {
            return None;
        }

        let offset = self.base + self.position as u64;
        let rest = &self.bytes[self.position..];
        let kind = match decode_header(rest) {
            Ok(kind) => kind,
            Err(e) => {
                self.failed = true;
                return Some(Err(CoreError::consistency(format!("record at {offset}: {e}"))));
            }
        };

        let record = Record { offset, kind };
        let length = record.length();
        if length > rest.len() as u64 {
            self.failed = true;
            return Some(Err(CoreError::consistency(format!(
                "record at {offset} of length {length} exceeds the {} available bytes",
                rest.len()
            ))));
        }

        self.position += length as usize;
        Some(Ok(record))
    }
}

/// Encodes an entity record from its parts.
#[must_use]
pub fn encode_entity(type_id: TypeId, object_id: ObjectId, content: &[u8]) -> Vec<u8> {
    let length = ENTITY_HEADER_LENGTH + content.len() as u64;
    let mut record = Vec::with_capacity(length as usize);
    record.extend_from_slice(&(length as i64).to_le_bytes());
    record.extend_from_slice(&type_id.0.to_le_bytes());
    record.extend_from_slice(&object_id.0.to_le_bytes());
    record.extend_from_slice(content);
    record
}

/// Encodes a gap of `length` bytes (at least [`MIN_GAP_LENGTH`]).
#[must_use]
pub fn encode_gap(length: u64) -> Vec<u8> {
    let length = length.max(MIN_GAP_LENGTH);
    let mut gap = vec![0u8; length as usize];
    gap[..8].copy_from_slice(&(-(length as i64)).to_le_bytes());
    gap
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_roundtrip() {
        let record = encode_entity(TypeId(9), ObjectId(1001), b"payload");
        assert_eq!(record.len(), 31);
        assert_eq!(
            decode_header(&record).unwrap(),
            RecordKind::Entity(EntityHeader {
                length: 31,
                type_id: TypeId(9),
                object_id: ObjectId(1001),
            })
        );
    }

    #[test]
    fn zero_length_is_consistency_error() {
        let bytes = [0u8; 24];
        assert!(decode_header(&bytes).unwrap_err().is_consistency());
    }

    #[test]
    fn short_entity_length_rejected() {
        let mut record = encode_entity(TypeId(1), ObjectId(1), b"");
        record[..8].copy_from_slice(&16i64.to_le_bytes());
        assert!(decode_header(&record).is_err());
    }

    #[test]
    fn iteration_skips_gaps() {
        let mut bytes = encode_entity(TypeId(1), ObjectId(10), b"a");
        bytes.extend(encode_gap(16));
        bytes.extend(encode_entity(TypeId(2), ObjectId(11), b"bc"));

        let records: Vec<_> = RecordIter::new(&bytes, 100)
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 100);
        assert_eq!(records[1].kind, RecordKind::Gap(16));
        assert_eq!(records[2].offset, 100 + 25 + 16);
    }

    #[test]
    fn truncated_record_reported_once() {
        let mut bytes = encode_entity(TypeId(1), ObjectId(10), b"abcdef");
        bytes.truncate(27);

        let mut iter = RecordIter::new(&bytes, 0);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn reader_reports_out_of_range() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert!(reader.read_i64().is_err());
        assert_eq!(reader.remaining(), 2);
        assert!(u64_at(&[0; 10], 3).is_err());
        assert_eq!(u64_at(&7u64.to_le_bytes(), 0).unwrap(), 7);
    }

    proptest! {
        #[test]
        fn iteration_recovers_every_record(contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..20)) {
            let mut bytes = Vec::new();
            for (i, content) in contents.iter().enumerate() {
                bytes.extend(encode_entity(TypeId(3), ObjectId(i as u64 + 1), content));
            }

            let records: Vec<_> = RecordIter::new(&bytes, 0).collect::<CoreResult<_>>().unwrap();
            prop_assert_eq!(records.len(), contents.len());
            for (record, content) in records.iter().zip(&contents) {
                prop_assert_eq!(record.length(), ENTITY_HEADER_LENGTH + content.len() as u64);
            }
        }
    }
}
