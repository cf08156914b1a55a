//! # shardstore storage
//!
//! The file-system boundary of the shardstore engine.
//!
//! This crate is the only place that touches the operating system's files.
//! It knows nothing about data files, transactions logs or entity records;
//! it offers two layers:
//!
//! - [`StorageBackend`]: an opaque, append-only byte store for one open file
//!   (read at offset, append, flush, sync, truncate)
//! - [`FileSystem`]: path-level operations (open, exists, size, list,
//!   delete, rename, create directories, whole-file read/write)
//!
//! ## Available implementations
//!
//! - [`FileBackend`] / [`LocalFileSystem`] - persistent storage on OS files
//! - [`InMemoryBackend`] / [`InMemoryFileSystem`] - for tests and ephemeral
//!   storages
//!
//! ## Example
//!
//! ```rust
//! use shardstore_storage::{FileSystem, InMemoryFileSystem, StorageBackend};
//! use std::path::Path;
//!
//! let fs = InMemoryFileSystem::new();
//! let mut file = fs.open(Path::new("channel_0/channel_0_1.dat")).unwrap();
//! let offset = file.append(b"hello world").unwrap();
//! assert_eq!(file.read_at(offset, 5).unwrap(), b"hello");
//! assert_eq!(fs.file_size(Path::new("channel_0/channel_0_1.dat")).unwrap(), 11);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod fs;
mod memory;

pub use backend::{copy_range, StorageBackend, COPY_BUFFER_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use fs::{FileSystem, LocalFileSystem};
pub use memory::{InMemoryBackend, InMemoryFileSystem};
