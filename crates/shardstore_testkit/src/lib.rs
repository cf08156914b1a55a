//! # shardstore testkit
//!
//! Test utilities for shardstore.
//!
//! This crate provides:
//! - Storage fixtures over a temporary directory or an in-memory file system
//! - A record builder and a small object-graph type dictionary
//! - Crash simulation: fault-injecting file systems and file damage helpers
//! - Stress testing utilities
//! - Property-based test generators using proptest
//!
//! The end-to-end tests of the workspace live in this crate's `tests/`
//! directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shardstore_testkit::prelude::*;
//!
//! #[test]
//! fn stores_survive_restart() {
//!     let mut storage = TestStorage::memory(4);
//!     storage.store(&RecordBuilder::new().blob(1, b"a").build()).unwrap();
//!     storage.restart().unwrap();
//!     assert_eq!(loaded_object_ids(&storage.load_by_object_ids(&[ObjectId(1)]).unwrap()), vec![1]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use shardstore_core::{ObjectId, StorageConfig, StorageSystem, TypeId};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
