//! Storage backend trait definition.

use crate::error::StorageResult;

/// Chunk size used when copying between backends.
pub const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// One open file, seen as an opaque append-only byte store.
///
/// The engine never rewrites bytes in place: data files and transactions
/// logs only grow by appending and shrink by truncation. Backends do not
/// interpret what they store.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `size` is the offset the next `append` writes to
/// - Backends must be `Send + Sync` so handles can be shared with the
///   backup thread
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends beyond the current size or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the file and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all data and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the file down to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}

/// Copies `len` bytes starting at `offset` of `source` to the end of
/// `target`, in chunks of [`COPY_BUFFER_SIZE`].
///
/// Returns the offset in `target` where the copied range starts.
///
/// # Errors
///
/// Returns an error if reading or appending fails.
pub fn copy_range(
    source: &dyn StorageBackend,
    offset: u64,
    len: u64,
    target: &mut dyn StorageBackend,
) -> StorageResult<u64> {
    let start = target.size()?;
    let mut copied = 0u64;
    while copied < len {
        let chunk = (len - copied).min(COPY_BUFFER_SIZE as u64) as usize;
        let bytes = source.read_at(offset + copied, chunk)?;
        target.append(&bytes)?;
        copied += chunk as u64;
    }
    Ok(start)
}
