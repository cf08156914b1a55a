//! Channel tasks and their synchronization.
//!
//! Every storage operation is a task processed by all channels. A task
//! counts the channels that still have to process it and the channels
//! that still have to complete it. Processing computes or writes; after
//! every channel has processed, each channel either commits its part
//! (`succeed`) or undoes it (`fail`), depending on whether any channel
//! reported a problem. The issuing thread blocks in
//! [`TaskCore::wait_on_completion`] until every channel completed.

pub(crate) mod broker;
pub(crate) mod requests;

pub(crate) use broker::TaskBroker;

use crate::channel::Channel;
use crate::controller::OperationController;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How often waiting threads re-check the controller.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ChannelProblem {
    first: Arc<CoreError>,
    suppressed: Vec<Arc<CoreError>>,
}

#[derive(Debug)]
struct TaskState {
    remaining_processing: usize,
    remaining_completion: usize,
    problems: Vec<Option<ChannelProblem>>,
    first_problem_channel: Option<usize>,
}

/// Synchronization state shared by every kind of task.
#[derive(Debug)]
pub(crate) struct TaskCore {
    timestamp: i64,
    state: Mutex<TaskState>,
    changed: Condvar,
    controller: Arc<OperationController>,
}

impl TaskCore {
    pub(crate) fn new(timestamp: i64, channel_count: usize, controller: Arc<OperationController>) -> Self {
        Self {
            timestamp,
            state: Mutex::new(TaskState {
                remaining_processing: channel_count,
                remaining_completion: channel_count,
                problems: (0..channel_count).map(|_| None).collect(),
                first_problem_channel: None,
            }),
            changed: Condvar::new(),
            controller,
        }
    }

    /// Issuance timestamp, unique and increasing per broker.
    pub(crate) const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Records a problem of `channel`. Later problems of the same channel
    /// become suppressed causes of the first.
    pub(crate) fn record_problem(&self, channel: usize, problem: Arc<CoreError>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.problems.get_mut(channel) {
            Some(Some(existing)) => existing.suppressed.push(problem),
            Some(slot) => {
                *slot = Some(ChannelProblem {
                    first: problem,
                    suppressed: Vec::new(),
                });
                state.first_problem_channel.get_or_insert(channel);
            }
            None => {}
        }
        self.changed.notify_all();
    }

    pub(crate) fn controller(&self) -> &OperationController {
        &self.controller
    }

    pub(crate) fn has_problems(&self) -> bool {
        self.state.lock().first_problem_channel.is_some()
    }

    fn failure(state: &TaskState) -> Option<CoreError> {
        let channel = state.first_problem_channel?;
        let problem = state.problems.get(channel)?.as_ref()?;
        Some(CoreError::ChannelFailure {
            channel,
            source: Arc::clone(&problem.first),
            suppressed: problem.suppressed.clone(),
        })
    }

    fn finish_processing(&self) {
        let mut state = self.state.lock();
        state.remaining_processing = state.remaining_processing.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Blocks until every channel processed the task. Returns false if
    /// the storage stopped first.
    fn wait_for_processing(&self) -> bool {
        let mut state = self.state.lock();
        while state.remaining_processing > 0 {
            if !self.controller.is_running() {
                return false;
            }
            self.changed.wait_for(&mut state, POLL_INTERVAL);
        }
        true
    }

    fn finish_completion(&self) {
        let mut state = self.state.lock();
        state.remaining_completion = state.remaining_completion.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Blocks until every channel completed the task.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError::ChannelFailure`] for the first channel that
    /// reported a problem, or [`CoreError::NotRunning`] if the storage
    /// stopped before the task completed.
    pub(crate) fn wait_on_completion(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.remaining_completion == 0 {
                return Self::failure(&state).map_or(Ok(()), Err);
            }
            if !self.controller.is_running() {
                return Err(Self::failure(&state).unwrap_or(CoreError::NotRunning));
            }
            self.changed.wait_for(&mut state, POLL_INTERVAL);
        }
    }
}

/// A unit of work processed by every channel.
pub(crate) trait ChannelTask: Send + Sync + fmt::Debug {
    fn core(&self) -> &TaskCore;

    /// Computes or writes this channel's part.
    fn process_by(&self, channel: &mut Channel) -> CoreResult<()>;

    /// Commits this channel's part once every channel processed without
    /// problems.
    fn succeed(&self, _channel: &mut Channel) -> CoreResult<()> {
        Ok(())
    }

    /// Undoes this channel's part after a problem in any channel.
    fn fail(&self, _channel: &mut Channel) -> CoreResult<()> {
        Ok(())
    }

    /// Runs last, after `succeed` or `fail`.
    fn clean_up(&self, _channel: &mut Channel) {}

    /// Returns true if the channel stops after this task.
    fn stops_channel(&self) -> bool {
        false
    }
}

/// Runs `task` on `channel` through processing, the barrier and completion.
///
/// A problem that leaves the channel unusable is registered as a
/// disruption the moment it occurs and returned: any processing failure
/// other than a validation error, and any failure to commit or undo.
pub(crate) fn execute(task: &dyn ChannelTask, channel: &mut Channel) -> Option<Arc<CoreError>> {
    let core = task.core();
    let index = channel.index();
    let mut disruption = None;

    let processed = task.process_by(channel);
    let processed_ok = processed.is_ok();
    if let Err(error) = processed {
        let error = Arc::new(error);
        core.record_problem(index, Arc::clone(&error));
        if !error.is_validation() {
            core.controller.register_disruption(Arc::clone(&error));
            disruption = Some(error);
        }
    }
    core.finish_processing();

    let commit = processed_ok && core.wait_for_processing() && !core.has_problems();
    let outcome = if commit { task.succeed(channel) } else { task.fail(channel) };
    if let Err(error) = outcome {
        let error = Arc::new(error);
        core.record_problem(index, Arc::clone(&error));
        if disruption.is_none() {
            core.controller.register_disruption(Arc::clone(&error));
            disruption = Some(error);
        }
    }
    task.clean_up(channel);
    core.finish_completion();
    disruption
}
