//! Data file size and consolidation policy.

use crate::error::{CoreError, CoreResult};

const MIN_FILE_SIZE_BOUND: u64 = 1024;
const MAX_FILE_SIZE_BOUND: u64 = i32::MAX as u64;
const MAX_TRANSACTIONS_SIZE_BOUND: u64 = 1 << 30;

/// What the policy needs to know about one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetrics {
    /// Bytes written to the file.
    pub total_length: u64,
    /// Bytes of live entity records.
    pub content_length: u64,
    /// Whether the file holds exactly one live entity.
    pub single_entity: bool,
    /// Whether the file is the channel's head file.
    pub is_head: bool,
}

impl FileMetrics {
    /// Ratio of live data to total length; an empty file counts as full.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        if self.total_length == 0 {
            1.0
        } else {
            self.content_length as f64 / self.total_length as f64
        }
    }
}

/// Decides when a new head file is started and when a file is dissolved.
///
/// A file is dissolved (its live entities transferred to the head file,
/// the file deleted) when it is too small, too sparse, or too large. A file
/// that is too large only because it holds one oversized entity is kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFileEvaluator {
    min_file_size: u64,
    max_file_size: u64,
    minimum_use_ratio: f64,
    clean_up_head_file: bool,
    transactions_file_max_size: u64,
}

impl Default for DataFileEvaluator {
    fn default() -> Self {
        Self {
            min_file_size: 1 << 20,
            max_file_size: 8 << 20,
            minimum_use_ratio: 0.75,
            clean_up_head_file: true,
            transactions_file_max_size: 100 << 20,
        }
    }
}

impl DataFileEvaluator {
    /// Creates a validated evaluator.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error if a value is out of range,
    /// see [`DataFileEvaluator::validate`].
    pub fn new(
        min_file_size: u64,
        max_file_size: u64,
        minimum_use_ratio: f64,
        clean_up_head_file: bool,
    ) -> CoreResult<Self> {
        let evaluator = Self {
            min_file_size,
            max_file_size,
            minimum_use_ratio,
            clean_up_head_file,
            ..Self::default()
        };
        evaluator.validate()?;
        Ok(evaluator)
    }

    /// Sets the transactions log size that triggers compaction.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error outside `1024..=1 GiB`.
    pub fn with_transactions_file_max_size(mut self, size: u64) -> CoreResult<Self> {
        self.transactions_file_max_size = size;
        self.validate()?;
        Ok(self)
    }

    /// Checks the value ranges: sizes within `[1024, i32::MAX]`, the
    /// maximum at least 1024 bytes above the minimum, the ratio in `(0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error naming the bad value.
    pub fn validate(&self) -> CoreResult<()> {
        for (name, size) in [("minimum", self.min_file_size), ("maximum", self.max_file_size)] {
            if !(MIN_FILE_SIZE_BOUND..=MAX_FILE_SIZE_BOUND).contains(&size) {
                return Err(CoreError::invalid_config(format!(
                    "{name} file size {size} outside [{MIN_FILE_SIZE_BOUND}, {MAX_FILE_SIZE_BOUND}]"
                )));
            }
        }
        if self.max_file_size - MIN_FILE_SIZE_BOUND < self.min_file_size {
            return Err(CoreError::invalid_config(format!(
                "maximum file size {} must exceed the minimum {} by at least {MIN_FILE_SIZE_BOUND}",
                self.max_file_size, self.min_file_size
            )));
        }
        if !(self.minimum_use_ratio > 0.0 && self.minimum_use_ratio <= 1.0) {
            return Err(CoreError::invalid_config(format!(
                "minimum use ratio {} outside (0, 1]",
                self.minimum_use_ratio
            )));
        }
        if !(MIN_FILE_SIZE_BOUND..=MAX_TRANSACTIONS_SIZE_BOUND).contains(&self.transactions_file_max_size) {
            return Err(CoreError::invalid_config(format!(
                "transactions file maximum {} outside [{MIN_FILE_SIZE_BOUND}, {MAX_TRANSACTIONS_SIZE_BOUND}]",
                self.transactions_file_max_size
            )));
        }
        Ok(())
    }

    /// Minimum size of a non-head file.
    #[must_use]
    pub const fn min_file_size(&self) -> u64 {
        self.min_file_size
    }

    /// Size at which a new head file is started.
    #[must_use]
    pub const fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Minimum ratio of live data.
    #[must_use]
    pub const fn minimum_use_ratio(&self) -> f64 {
        self.minimum_use_ratio
    }

    /// Whether the head file is subject to consolidation.
    #[must_use]
    pub const fn clean_up_head_file(&self) -> bool {
        self.clean_up_head_file
    }

    /// Transactions log size that triggers compaction.
    #[must_use]
    pub const fn transactions_file_max_size(&self) -> u64 {
        self.transactions_file_max_size
    }

    /// Returns true if a new head file must be started before appending
    /// `pending_length` bytes. An empty head takes any append.
    #[must_use]
    pub fn needs_retirement(&self, total_length: u64, pending_length: u64) -> bool {
        total_length >= self.max_file_size
            || (total_length > 0 && total_length.saturating_add(pending_length) > self.max_file_size)
    }

    /// Returns true if the file should be dissolved.
    #[must_use]
    pub fn needs_dissolving(&self, file: &FileMetrics) -> bool {
        if file.is_head && !self.clean_up_head_file {
            return false;
        }
        let too_small = file.total_length < self.min_file_size && !file.is_head;
        let too_sparse = file.fill_ratio() < self.minimum_use_ratio;
        let oversized_single = file.single_entity && file.content_length == file.total_length;
        let too_large = file.total_length > self.max_file_size && !oversized_single;
        too_small || too_sparse || too_large
    }
}
