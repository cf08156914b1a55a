//! Error types for the storage engine.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the storage engine.
///
/// The variants follow the engine's failure taxonomy:
///
/// - [`CoreError::Consistency`]: garbled on-disk structure, fatal to the
///   channel that found it
/// - [`CoreError::Storage`] / [`CoreError::Io`]: I/O failures, surfaced as
///   disruptions
/// - [`CoreError::Validation`]: entity data outside its type's bounds, fatal
///   only to the operation that carried it
/// - [`CoreError::NotRunning`]: the storage no longer accepts work
#[derive(Debug, Error)]
pub enum CoreError {
    /// File-system error.
    #[error("storage error: {0}")]
    Storage(#[from] shardstore_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk structures contradict each other.
    #[error("consistency error: {message}")]
    Consistency {
        /// Description of the inconsistency.
        message: String,
    },

    /// Entity data rejected before it was written.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the rejected data.
        message: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the invalid setting.
        message: String,
    },

    /// The storage has been shut down or disrupted.
    #[error("storage is not running")]
    NotRunning,

    /// Another process owns the storage lock file.
    #[error("storage already in use by {owner}")]
    StorageLocked {
        /// Identifier found in the lock file.
        owner: String,
    },

    /// A channel failed while processing a task.
    #[error("channel {channel} failed: {source}")]
    ChannelFailure {
        /// Index of the first channel that reported a problem.
        channel: usize,
        /// The first problem reported by that channel.
        #[source]
        source: Arc<CoreError>,
        /// Further problems of that channel.
        suppressed: Vec<Arc<CoreError>>,
    },

    /// Several independent failures, e.g. from closing or deleting a set of
    /// files.
    #[error("{message} ({} causes)", .causes.len())]
    MultiCause {
        /// Summary of the failed operation.
        message: String,
        /// Every collected failure.
        causes: Vec<Arc<CoreError>>,
    },
}

impl CoreError {
    /// Creates a consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Returns true for errors that only reject the triggering operation.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation { .. } => true,
            Self::ChannelFailure { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// Returns true for consistency errors, also when wrapped in a channel
    /// failure.
    #[must_use]
    pub fn is_consistency(&self) -> bool {
        match self {
            Self::Consistency { .. } => true,
            Self::ChannelFailure { source, .. } => source.is_consistency(),
            _ => false,
        }
    }
}

/// Collects failures of independent steps so that every step runs.
#[derive(Debug, Default)]
pub(crate) struct ErrorCollector {
    causes: Vec<Arc<CoreError>>,
}

impl ErrorCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn collect(&mut self, result: CoreResult<()>) {
        if let Err(e) = result {
            self.causes.push(Arc::new(e));
        }
    }

    pub(crate) fn push(&mut self, error: Arc<CoreError>) {
        self.causes.push(error);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    /// Returns `Ok` if nothing was collected, otherwise a multi-cause error.
    pub(crate) fn finish(self, message: impl Into<String>) -> CoreResult<()> {
        if self.causes.is_empty() {
            Ok(())
        } else {
            Err(CoreError::MultiCause {
                message: message.into(),
                causes: self.causes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_failure_keeps_classification() {
        let error = CoreError::ChannelFailure {
            channel: 2,
            source: Arc::new(CoreError::validation("length 3 below minimum")),
            suppressed: Vec::new(),
        };
        assert!(error.is_validation());
        assert!(!error.is_consistency());
        assert!(error.to_string().starts_with("channel 2 failed"));
    }

    #[test]
    fn collector_finishes_ok_when_empty() {
        let mut collector = ErrorCollector::new();
        collector.collect(Ok(()));
        assert!(collector.is_empty());
        assert!(collector.finish("closing files").is_ok());
    }

    #[test]
    fn collector_reports_every_cause() {
        let mut collector = ErrorCollector::new();
        collector.collect(Err(CoreError::consistency("a")));
        collector.collect(Ok(()));
        collector.collect(Err(CoreError::NotRunning));

        match collector.finish("closing files") {
            Err(CoreError::MultiCause { causes, message }) => {
                assert_eq!(causes.len(), 2);
                assert_eq!(message, "closing files");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
