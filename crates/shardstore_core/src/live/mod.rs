//! Live data files of a channel.
//!
//! - [`evaluator`]: when to start a new head file and when to dissolve one
//! - `manager`: the channel's files and transactions log, stores,
//!   transfers, truncation and deletion
//! - `initializer`: startup replay, repair and entity registration

pub(crate) mod data_file;
pub mod evaluator;
pub(crate) mod initializer;
pub(crate) mod manager;

pub use evaluator::{DataFileEvaluator, FileMetrics};

use crate::files::StorageLayout;
use crate::stats::StorageStats;
use crate::writer::StorageWriter;
use shardstore_storage::FileSystem;
use std::sync::Arc;

/// Everything a channel needs to work on its files.
#[derive(Debug, Clone)]
pub(crate) struct FileContext {
    pub(crate) channel: usize,
    pub(crate) channel_count: usize,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) layout: StorageLayout,
    pub(crate) writer: Arc<dyn StorageWriter>,
    pub(crate) evaluator: DataFileEvaluator,
    pub(crate) stats: Arc<StorageStats>,
}
