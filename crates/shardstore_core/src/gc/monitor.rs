//! Cross-channel coordination of marking and sweeping.

use super::mark_queue::ObjectIdMarkQueue;
use crate::error::{CoreError, CoreResult};
use crate::types::ObjectId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct MonitorState {
    pending_marks: usize,
    pending_store_updates: Vec<bool>,
    pending_store_update_count: usize,
    needs_sweep: Vec<bool>,
    sweeping_count: usize,
    channel_root_ids: Vec<u64>,
    hot_complete: bool,
    cold_complete: bool,
    sweep_generation: u64,
    hot_generation: u64,
    cold_generation: u64,
}

impl MonitorState {
    fn new(channel_count: usize) -> Self {
        Self {
            pending_marks: 0,
            pending_store_updates: vec![false; channel_count],
            pending_store_update_count: 0,
            needs_sweep: vec![false; channel_count],
            sweeping_count: 0,
            channel_root_ids: vec![0; channel_count],
            // nothing to collect before the first store
            hot_complete: true,
            cold_complete: true,
            sweep_generation: 0,
            hot_generation: 0,
            cold_generation: 0,
        }
    }

    fn is_marking_complete(&self) -> bool {
        self.pending_marks == 0 && self.pending_store_update_count == 0
    }
}

/// Snapshot of the GC progress, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStatus {
    /// Number of enqueued but not yet processed mark IDs.
    pub pending_marks: usize,
    /// Completed sweep rounds.
    pub sweep_generation: u64,
    /// Completed hot phases.
    pub hot_generation: u64,
    /// Completed cold phases.
    pub cold_generation: u64,
    /// Whether the current cycle finished its hot phase.
    pub hot_complete: bool,
    /// Whether the current cycle is fully complete.
    pub cold_complete: bool,
}

/// Shared GC state of all channels.
///
/// Marking is incremental and runs on every channel at once; this monitor
/// counts the IDs in flight across all mark queues to know when reachability
/// is established, then lets every channel sweep once. One mark/sweep round
/// completes the "hot" phase, a second one the "cold" phase: only after the
/// cold phase has every unreachable entity been collected, because entities
/// loaded at startup or stored during a round survive that round.
///
/// Lock order: monitor state first, then a mark queue.
#[derive(Debug)]
pub struct MarkMonitor {
    state: Mutex<MonitorState>,
    queues: Vec<Arc<ObjectIdMarkQueue>>,
}

impl MarkMonitor {
    /// Creates a monitor with one mark queue per channel.
    #[must_use]
    pub fn new(channel_count: usize, segment_length: usize) -> Self {
        Self {
            state: Mutex::new(MonitorState::new(channel_count)),
            queues: (0..channel_count)
                .map(|_| Arc::new(ObjectIdMarkQueue::new(segment_length)))
                .collect(),
        }
    }

    /// Number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.queues.len()
    }

    /// The mark queue of `channel`.
    #[must_use]
    pub fn queue(&self, channel: usize) -> &Arc<ObjectIdMarkQueue> {
        &self.queues[channel]
    }

    /// Enqueues one ID into `channel`'s queue.
    pub fn enqueue(&self, channel: usize, id: ObjectId) {
        let mut state = self.state.lock();
        state.pending_marks += 1;
        self.queues[channel].enqueue(id.0);
    }

    /// Enqueues buffered IDs, one buffer per target channel, and clears the
    /// buffers.
    pub fn enqueue_bulk(&self, buffers: &mut [Vec<u64>]) {
        let mut state = self.state.lock();
        for (queue, buffer) in self.queues.iter().zip(buffers.iter_mut()) {
            if buffer.is_empty() {
                continue;
            }
            state.pending_marks += buffer.len();
            queue.enqueue_bulk(buffer);
            buffer.clear();
        }
    }

    /// Removes `count` processed IDs from `channel`'s queue.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if fewer marks are pending than
    /// processed.
    pub fn advance_marking(&self, channel: usize, count: usize) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.pending_marks < count {
            return Err(CoreError::consistency(format!(
                "channel {channel} processed {count} marks but only {} are pending",
                state.pending_marks
            )));
        }
        let removed = self.queues[channel].advance(count);
        if removed != count {
            return Err(CoreError::consistency(format!(
                "channel {channel} mark queue held {removed} of {count} processed marks"
            )));
        }
        state.pending_marks -= count;
        Ok(())
    }

    /// Registers that `channel` is about to write a store.
    pub fn register_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if !state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = true;
            state.pending_store_update_count += 1;
        }
    }

    /// Clears the pending store registration of `channel`.
    pub fn clear_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = false;
            state.pending_store_update_count -= 1;
        }
    }

    /// Returns true if `channel` still has to run its sweep of the current
    /// round.
    #[must_use]
    pub fn is_pending_sweep(&self, channel: usize) -> bool {
        self.state.lock().needs_sweep[channel]
    }

    /// Returns true if no marks are in flight and no store is pending.
    #[must_use]
    pub fn is_marking_complete(&self) -> bool {
        self.state.lock().is_marking_complete()
    }

    /// Returns true if `channel` must sweep now. Starts a sweep round for
    /// all channels if marking has completed and no round is running.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if a mark queue still holds IDs when a
    /// round starts.
    pub fn needs_sweep(&self, channel: usize) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if state.needs_sweep[channel] {
            return Ok(true);
        }
        if state.sweeping_count != 0 || !state.is_marking_complete() {
            return Ok(false);
        }

        state.channel_root_ids.iter_mut().for_each(|id| *id = 0);
        for (index, queue) in self.queues.iter().enumerate() {
            if !queue.is_empty() {
                return Err(CoreError::consistency(format!(
                    "mark queue of channel {index} holds {} IDs although marking is complete",
                    queue.len()
                )));
            }
            queue.reset();
        }
        state.needs_sweep.iter_mut().for_each(|flag| *flag = true);
        state.sweeping_count = state.needs_sweep.len();
        debug!(generation = state.sweep_generation, "sweep round started");
        Ok(true)
    }

    /// Records that `channel` finished its sweep with the given root ID
    /// (0 if it has no root entity). The last channel to finish advances
    /// GC completion and enqueues the newest root to start the next mark
    /// round.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if `channel` was not sweeping.
    pub fn complete_sweep(&self, channel: usize, root_id: ObjectId) -> CoreResult<()> {
        let mut state = self.state.lock();
        if !state.needs_sweep[channel] {
            return Err(CoreError::consistency(format!(
                "channel {channel} completed a sweep it was not asked for"
            )));
        }
        state.channel_root_ids[channel] = root_id.0;
        state.needs_sweep[channel] = false;
        state.sweeping_count -= 1;
        if state.sweeping_count > 0 {
            return Ok(());
        }

        state.sweep_generation += 1;
        Self::advance_completion(&mut state);

        let root = state.channel_root_ids.iter().copied().max().unwrap_or(0);
        if root != 0 {
            let target = ObjectId(root).channel(self.queues.len());
            state.pending_marks += 1;
            self.queues[target].enqueue(root);
        }
        Ok(())
    }

    fn advance_completion(state: &mut MonitorState) {
        if state.cold_complete {
            debug!("garbage collection not needed");
        } else if state.hot_complete {
            state.cold_complete = true;
            state.cold_generation += 1;
            debug!(generation = state.cold_generation, "garbage collection cold phase complete");
        } else {
            state.hot_complete = true;
            state.hot_generation += 1;
            debug!(generation = state.hot_generation, "garbage collection hot phase complete");
        }
    }

    /// Called on every store: the stored data may have made entities
    /// unreachable, so a new cycle is needed.
    pub fn reset_completion(&self) {
        let mut state = self.state.lock();
        state.hot_complete = false;
        state.cold_complete = false;
    }

    /// Returns true if GC has nothing more to do for `channel`.
    #[must_use]
    pub fn is_complete(&self, channel: usize) -> bool {
        let state = self.state.lock();
        state.cold_complete
            || (state.hot_complete && state.sweeping_count > 0 && !state.needs_sweep[channel])
    }

    /// Returns the current progress.
    #[must_use]
    pub fn status(&self) -> GcStatus {
        let state = self.state.lock();
        GcStatus {
            pending_marks: state.pending_marks,
            sweep_generation: state.sweep_generation,
            hot_generation: state.hot_generation,
            cold_generation: state.cold_generation,
            hot_complete: state.hot_complete,
            cold_complete: state.cold_complete,
        }
    }

    /// Returns everything to the initial state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = MonitorState::new(self.queues.len());
        for queue in &self.queues {
            queue.reset();
        }
    }
}

/// Buffers reference IDs found by one channel and hands them to the
/// monitor in bulk, sorted by target channel.
#[derive(Debug)]
pub struct ReferenceMarker {
    monitor: Arc<MarkMonitor>,
    buffers: Vec<Vec<u64>>,
    capacity: usize,
    mask: u64,
}

impl ReferenceMarker {
    /// Creates a marker flushing whenever one buffer holds `capacity` IDs.
    #[must_use]
    pub fn new(monitor: Arc<MarkMonitor>, capacity: usize) -> Self {
        let channel_count = monitor.channel_count();
        let capacity = capacity.max(1);
        Self {
            monitor,
            buffers: (0..channel_count).map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
            mask: channel_count as u64 - 1,
        }
    }

    /// Buffers a reference; null references are ignored.
    pub fn mark(&mut self, id: ObjectId) {
        if id.is_null() {
            return;
        }
        let buffer = &mut self.buffers[(id.0 & self.mask) as usize];
        buffer.push(id.0);
        if buffer.len() >= self.capacity {
            self.flush();
        }
    }

    /// Hands all buffered IDs to the monitor.
    pub fn flush(&mut self) {
        if self.buffers.iter().any(|buffer| !buffer.is_empty()) {
            self.monitor.enqueue_bulk(&mut self.buffers);
        }
    }
}
