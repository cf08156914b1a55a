//! Storage configuration.

use crate::error::{CoreError, CoreResult};
use crate::gc::evaluator::DefaultCacheEvaluator;
use crate::gc::mark_queue::DEFAULT_SEGMENT_LENGTH;
use crate::live::evaluator::DataFileEvaluator;
use crate::types::{is_valid_channel_count, MAX_CHANNEL_COUNT};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names of the files and directories inside a storage directory.
///
/// ```text
/// <base>/
/// ├─ used.lock
/// ├─ channel_0/
/// │  ├─ channel_0_1.dat
/// │  ├─ channel_0_2.dat
/// │  └─ transactions_0.sft
/// └─ channel_1/
///    └─ ...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    /// Prefix of the per-channel directories.
    pub channel_directory_prefix: String,
    /// Prefix of data file names, followed by `<channel>_<number>`.
    pub data_file_prefix: String,
    /// Extension of data files.
    pub data_file_type: String,
    /// Prefix of transactions log names, followed by `<channel>`.
    pub transactions_file_prefix: String,
    /// Extension of transactions logs.
    pub transactions_file_type: String,
    /// Name of the process lock file in the storage root.
    pub lock_file_name: String,
}

impl Default for FileNaming {
    fn default() -> Self {
        Self {
            channel_directory_prefix: "channel_".to_owned(),
            data_file_prefix: "channel_".to_owned(),
            data_file_type: "dat".to_owned(),
            transactions_file_prefix: "transactions_".to_owned(),
            transactions_file_type: "sft".to_owned(),
            lock_file_name: "used.lock".to_owned(),
        }
    }
}

/// Background maintenance run by every channel between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingConfig {
    /// Pause between two housekeeping runs.
    pub interval: Duration,
    /// Time each of file cleanup, GC and cache check may take per run.
    pub time_budget: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            time_budget: Duration::from_millis(10),
        }
    }
}

/// Garbage collector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// IDs taken from the mark queue per batch.
    pub mark_buffer_size: usize,
    /// How long an idle channel waits for other channels' marks.
    pub marking_wait: Duration,
    /// IDs buffered per target channel before they are handed over.
    pub reference_buffer_size: usize,
    /// IDs per mark queue segment.
    pub mark_segment_length: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mark_buffer_size: 10_000,
            marking_wait: Duration::from_millis(10),
            reference_buffer_size: 100,
            mark_segment_length: DEFAULT_SEGMENT_LENGTH,
        }
    }
}

/// Mirror of every file mutation into a second directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Root of the backup copy.
    pub directory: PathBuf,
    /// Whether deleting a primary file deletes its backup copy.
    pub deletion_enabled: bool,
    /// Move deleted backup files here instead of deleting them.
    pub deletion_directory: Option<PathBuf>,
    /// Longest time the backup thread blocks waiting for work.
    pub poll_interval: Duration,
}

impl BackupConfig {
    /// Creates a backup configuration for `directory` that keeps deleted
    /// files.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            deletion_enabled: false,
            deletion_directory: None,
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Sets whether primary deletions are mirrored.
    #[must_use]
    pub const fn deletion_enabled(mut self, value: bool) -> Self {
        self.deletion_enabled = value;
        self
    }

    /// Sets the directory deleted backup files are moved to.
    #[must_use]
    pub fn deletion_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.deletion_directory = Some(directory.into());
        self
    }
}

/// Process lock file settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFileConfig {
    /// Whether the lock file is used at all.
    pub enabled: bool,
    /// How often the lock file is rewritten.
    pub update_interval: Duration,
    /// Owner identifier; a random UUID is used if `None`.
    pub identifier: Option<String>,
}

impl Default for LockFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval: Duration::from_secs(10),
            identifier: None,
        }
    }
}

/// Configuration for starting a storage.
///
/// # Example
///
/// ```rust,ignore
/// use shardstore_core::StorageConfig;
///
/// let config = StorageConfig::new("data")
///     .channel_count(4)
///     .housekeeping_interval(Duration::from_millis(500));
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the storage.
    pub base_directory: PathBuf,
    /// Number of channels, a power of two in `1..=1024`.
    pub channel_count: usize,
    /// File and directory names.
    pub naming: FileNaming,
    /// Background maintenance.
    pub housekeeping: HousekeepingConfig,
    /// Data file size and consolidation policy.
    pub data_files: DataFileEvaluator,
    /// Entity cache eviction policy.
    pub cache: DefaultCacheEvaluator,
    /// Garbage collector tuning.
    pub gc: GcConfig,
    /// Optional backup mirror.
    pub backup: Option<BackupConfig>,
    /// Process lock file.
    pub lock_file: LockFileConfig,
    /// Move deleted data files here instead of deleting them.
    pub deletion_directory: Option<PathBuf>,
    /// Copy truncated data file tails here before truncating.
    pub truncation_directory: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("storage"),
            channel_count: 1,
            naming: FileNaming::default(),
            housekeeping: HousekeepingConfig::default(),
            data_files: DataFileEvaluator::default(),
            cache: DefaultCacheEvaluator::default(),
            gc: GcConfig::default(),
            backup: None,
            lock_file: LockFileConfig::default(),
            deletion_directory: None,
            truncation_directory: None,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with default values for `base_directory`.
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            ..Self::default()
        }
    }

    /// The storage root.
    #[must_use]
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Sets the channel count.
    #[must_use]
    pub const fn channel_count(mut self, count: usize) -> Self {
        self.channel_count = count;
        self
    }

    /// Sets the housekeeping interval.
    #[must_use]
    pub const fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping.interval = interval;
        self
    }

    /// Sets the housekeeping time budget.
    #[must_use]
    pub const fn housekeeping_budget(mut self, budget: Duration) -> Self {
        self.housekeeping.time_budget = budget;
        self
    }

    /// Sets the data file policy.
    #[must_use]
    pub const fn data_files(mut self, evaluator: DataFileEvaluator) -> Self {
        self.data_files = evaluator;
        self
    }

    /// Sets the cache policy.
    #[must_use]
    pub const fn cache(mut self, evaluator: DefaultCacheEvaluator) -> Self {
        self.cache = evaluator;
        self
    }

    /// Sets the GC tuning.
    #[must_use]
    pub const fn gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Enables the backup mirror.
    #[must_use]
    pub fn backup(mut self, backup: BackupConfig) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Sets the lock file settings.
    #[must_use]
    pub fn lock_file(mut self, lock_file: LockFileConfig) -> Self {
        self.lock_file = lock_file;
        self
    }

    /// Disables the lock file.
    #[must_use]
    pub fn without_lock_file(mut self) -> Self {
        self.lock_file.enabled = false;
        self
    }

    /// Sets the rescue directory for deleted data files.
    #[must_use]
    pub fn deletion_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.deletion_directory = Some(directory.into());
        self
    }

    /// Sets the rescue directory for truncated data file tails.
    #[must_use]
    pub fn truncation_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.truncation_directory = Some(directory.into());
        self
    }

    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error naming the first bad setting.
    pub fn validate(&self) -> CoreResult<()> {
        if !is_valid_channel_count(self.channel_count) {
            return Err(CoreError::invalid_config(format!(
                "channel count {} must be a power of two in 1..={MAX_CHANNEL_COUNT}",
                self.channel_count
            )));
        }
        if self.housekeeping.interval.is_zero() {
            return Err(CoreError::invalid_config("housekeeping interval must not be zero"));
        }
        if self.gc.mark_buffer_size == 0 || self.gc.reference_buffer_size == 0 {
            return Err(CoreError::invalid_config("GC buffer sizes must not be zero"));
        }
        if self.lock_file.enabled && self.lock_file.update_interval.is_zero() {
            return Err(CoreError::invalid_config("lock file update interval must not be zero"));
        }
        let naming = &self.naming;
        if naming.data_file_type.is_empty()
            || naming.transactions_file_type.is_empty()
            || (naming.data_file_prefix == naming.transactions_file_prefix
                && naming.data_file_type == naming.transactions_file_type)
        {
            return Err(CoreError::invalid_config(
                "data files and transactions logs need distinguishable names",
            ));
        }
        if let Some(backup) = &self.backup {
            if backup.directory == self.base_directory {
                return Err(CoreError::invalid_config(
                    "backup directory must differ from the storage directory",
                ));
            }
        }
        self.data_files.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}
