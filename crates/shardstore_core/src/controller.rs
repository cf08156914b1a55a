//! Process-wide run state of a storage.

use crate::error::CoreError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Run/stop flag and disruption register shared by every thread of a
/// storage.
///
/// Consulted before every enqueue and on every channel loop iteration. A
/// registered disruption disables processing for good: the channels stop
/// and further operations fail with [`CoreError::NotRunning`].
#[derive(Debug, Default)]
pub struct OperationController {
    running: AtomicBool,
    disruptions: Mutex<Vec<Arc<CoreError>>>,
}

impl OperationController {
    /// Creates a controller that is not yet running.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables processing.
    pub fn activate(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Disables processing.
    pub fn deactivate(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Returns true while processing is enabled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Records a failure that leaves the storage unusable and disables
    /// processing.
    pub fn register_disruption(&self, disruption: Arc<CoreError>) {
        error!(error = %disruption, "storage disrupted");
        self.disruptions.lock().push(disruption);
        self.deactivate();
    }

    /// Returns true if any disruption was registered.
    #[must_use]
    pub fn has_disruptions(&self) -> bool {
        !self.disruptions.lock().is_empty()
    }

    /// Returns every registered disruption, oldest first.
    #[must_use]
    pub fn disruptions(&self) -> Vec<Arc<CoreError>> {
        self.disruptions.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disruption_stops_processing() {
        let controller = OperationController::new();
        assert!(!controller.is_running());
        controller.activate();
        assert!(controller.is_running());

        controller.register_disruption(Arc::new(CoreError::consistency("bad file")));
        assert!(!controller.is_running());
        assert!(controller.has_disruptions());
        assert_eq!(controller.disruptions().len(), 1);
    }
}
