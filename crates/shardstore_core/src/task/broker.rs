//! The shared task chain.

use super::{ChannelTask, TaskCore};
use crate::controller::OperationController;
use crate::error::{CoreError, CoreResult};
use crate::types::now_nanos;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
struct BrokerState {
    tasks: VecDeque<Arc<dyn ChannelTask>>,
    /// Sequence number of `tasks[0]`.
    base: u64,
    /// Sequence number of the next task per channel.
    cursors: Vec<u64>,
    last_timestamp: i64,
}

impl BrokerState {
    fn prune(&mut self) {
        let oldest = self.cursors.iter().copied().min().unwrap_or(self.base);
        while self.base < oldest && self.tasks.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// Issues tasks to every channel in issuance order.
///
/// Each channel reads the chain through its own cursor, so every channel
/// sees every task exactly once. A task leaves the chain once the slowest
/// channel has taken it.
#[derive(Debug)]
pub(crate) struct TaskBroker {
    state: Mutex<BrokerState>,
    available: Condvar,
    controller: Arc<OperationController>,
    channel_count: usize,
}

impl TaskBroker {
    pub(crate) fn new(channel_count: usize, controller: Arc<OperationController>) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                tasks: VecDeque::new(),
                base: 0,
                cursors: vec![0; channel_count],
                last_timestamp: 0,
            }),
            available: Condvar::new(),
            controller,
            channel_count,
        }
    }

    /// Makes every later task timestamp exceed `timestamp`.
    pub(crate) fn raise_timestamp_floor(&self, timestamp: i64) {
        let mut state = self.state.lock();
        state.last_timestamp = state.last_timestamp.max(timestamp);
    }

    /// Creates a task with the next timestamp and appends it to the chain.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotRunning`] if processing is disabled.
    pub(crate) fn submit<T>(&self, make: impl FnOnce(TaskCore) -> T) -> CoreResult<Arc<T>>
    where
        T: ChannelTask + 'static,
    {
        let mut state = self.state.lock();
        if !self.controller.is_running() {
            return Err(CoreError::NotRunning);
        }
        let timestamp = now_nanos().max(state.last_timestamp + 1);
        state.last_timestamp = timestamp;
        let task = Arc::new(make(TaskCore::new(
            timestamp,
            self.channel_count,
            Arc::clone(&self.controller),
        )));
        state.tasks.push_back(Arc::clone(&task) as Arc<dyn ChannelTask>);
        debug!(timestamp, pending = state.tasks.len(), "task issued");
        self.available.notify_all();
        Ok(task)
    }

    /// Takes the next task for `channel`, waiting up to `timeout` for one.
    pub(crate) fn next_task(&self, channel: usize, timeout: Duration) -> Option<Arc<dyn ChannelTask>> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            let cursor = state.cursors.get(channel).copied()?;
            let index = usize::try_from(cursor - state.base).ok()?;
            if let Some(task) = state.tasks.get(index).cloned() {
                state.cursors[channel] += 1;
                state.prune();
                return Some(task);
            }
            if waited {
                return None;
            }
            self.available.wait_for(&mut state, timeout);
            waited = true;
        }
    }

    /// Wakes channels waiting for tasks, e.g. to notice a stop.
    pub(crate) fn wake_all(&self) {
        self.available.notify_all();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[derive(Debug)]
    struct Noop(TaskCore);

    impl ChannelTask for Noop {
        fn core(&self) -> &TaskCore {
            &self.0
        }

        fn process_by(&self, _channel: &mut Channel) -> CoreResult<()> {
            Ok(())
        }
    }

    fn broker(channels: usize) -> (TaskBroker, Arc<OperationController>) {
        let controller = Arc::new(OperationController::new());
        controller.activate();
        (TaskBroker::new(channels, Arc::clone(&controller)), controller)
    }

    #[test]
    fn every_channel_sees_every_task_in_order() {
        let (broker, _) = broker(2);
        let first = broker.submit(Noop).unwrap();
        let second = broker.submit(Noop).unwrap();
        assert!(second.core().timestamp() > first.core().timestamp());

        for channel in 0..2 {
            let a = broker.next_task(channel, Duration::ZERO).unwrap();
            let b = broker.next_task(channel, Duration::ZERO).unwrap();
            assert_eq!(a.core().timestamp(), first.core().timestamp());
            assert_eq!(b.core().timestamp(), second.core().timestamp());
            assert!(broker.next_task(channel, Duration::from_millis(1)).is_none());
        }
        assert_eq!(broker.pending(), 0);
    }

    #[test]
    fn tasks_stay_until_the_slowest_channel_took_them() {
        let (broker, _) = broker(2);
        broker.submit(Noop).unwrap();
        broker.submit(Noop).unwrap();
        broker.next_task(0, Duration::ZERO).unwrap();
        broker.next_task(0, Duration::ZERO).unwrap();
        assert_eq!(broker.pending(), 2);
        broker.next_task(1, Duration::ZERO).unwrap();
        assert_eq!(broker.pending(), 1);
    }

    #[test]
    fn timestamps_respect_the_floor() {
        let (broker, _) = broker(1);
        let floor = now_nanos() + 1_000_000_000_000;
        broker.raise_timestamp_floor(floor);
        let task = broker.submit(Noop).unwrap();
        assert_eq!(task.core().timestamp(), floor + 1);
    }

    #[test]
    fn stopped_broker_rejects_tasks() {
        let (broker, controller) = broker(1);
        controller.deactivate();
        assert!(matches!(broker.submit(Noop), Err(CoreError::NotRunning)));
    }
}
