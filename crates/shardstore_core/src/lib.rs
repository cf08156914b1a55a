//! # shardstore core
//!
//! Storage engine for an embedded object-persistence layer.
//!
//! Entities are binary records identified by a 64-bit object ID. Each
//! object ID belongs to exactly one of a power-of-two number of channels
//! (`object_id & (channel_count - 1)`); every channel runs on its own thread
//! and owns:
//!
//! - an entity cache: the authoritative registry of the channel's entities,
//!   with cached bytes and the state of an incremental mark/sweep garbage
//!   collector
//! - append-only data files and a transactions log recording every file
//!   creation, store, transfer, truncation and deletion
//! - housekeeping that consolidates sparse files, compacts the log and
//!   evicts cached bytes within a time budget
//!
//! [`StorageSystem`] issues every operation as a task processed by all
//! channels and waits for all of them; a store is committed by every
//! channel or rolled back by every channel.
//!
//! ## Example
//!
//! ```rust
//! use shardstore_core::{
//!     encode_entity, ObjectId, SimpleTypeDictionary, StorageConfig, StorageSystem, TypeId, TypeLayout,
//! };
//! use shardstore_storage::{FileSystem, InMemoryFileSystem};
//! use std::sync::Arc;
//!
//! let dictionary = SimpleTypeDictionary::new();
//! dictionary.register(TypeLayout::new(TypeId(1), "Note")).unwrap();
//! let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
//!
//! let storage = StorageSystem::start(StorageConfig::new("/notes").channel_count(2), fs, Arc::new(dictionary)).unwrap();
//! storage.store(&encode_entity(TypeId(1), ObjectId(1), b"hello")).unwrap();
//! let loaded = storage.load_by_object_ids(&[ObjectId(1)]).unwrap();
//! assert_eq!(loaded.chunks.len(), 1);
//! storage.shutdown().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
pub mod binary;
mod cache;
mod channel;
mod chunk;
mod config;
mod controller;
mod dictionary;
mod error;
mod files;
pub mod gc;
pub mod live;
mod lock;
mod stats;
mod system;
mod task;
pub mod transactions;
mod types;
mod writer;

pub use binary::{decode_header, encode_entity, encode_gap, EntityHeader, Record, RecordIter, RecordKind};
pub use cache::GcColor;
pub use channel::IdAnalysis;
pub use config::{BackupConfig, FileNaming, GcConfig, HousekeepingConfig, LockFileConfig, StorageConfig};
pub use controller::OperationController;
pub use dictionary::{SimpleTypeDictionary, TypeDictionary, TypeLayout};
pub use error::{CoreError, CoreResult};
pub use files::{ChannelInventory, FileIdentity, FileKind, FileUser, StorageLayout, StoredFile};
pub use gc::{DefaultCacheEvaluator, EntityCacheEvaluator};
pub use live::{DataFileEvaluator, FileMetrics};
pub use lock::{LockFileContent, LockFileManager};
pub use stats::{ChannelStatistics, FileStatistics, RawFileStatistics, StatsSnapshot, StorageStats};
pub use system::StorageSystem;
pub use task::requests::{ExportedType, LoadedData};
pub use transactions::{EntryIter, TransactionEntry, TransactionsAnalysis};
pub use types::{is_valid_channel_count, now_millis, now_nanos, ObjectId, TypeId, MAX_CHANNEL_COUNT};
pub use writer::{DefaultWriter, StorageWriter};

/// Version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
