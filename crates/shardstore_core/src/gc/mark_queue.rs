//! Per-channel queue of object IDs awaiting mark processing.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of IDs per segment.
pub const DEFAULT_SEGMENT_LENGTH: usize = 1000;

#[derive(Debug)]
struct Segment {
    ids: Box<[u64]>,
    low: usize,
    high: usize,
}

impl Segment {
    fn new(length: usize) -> Self {
        Self {
            ids: vec![0; length].into_boxed_slice(),
            low: 0,
            high: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.high == self.ids.len()
    }

    fn len(&self) -> usize {
        self.high - self.low
    }
}

#[derive(Debug)]
struct QueueState {
    segments: VecDeque<Segment>,
    spare: Vec<Segment>,
    size: usize,
    segment_length: usize,
}

impl QueueState {
    fn tail_segment_for_write(&mut self) -> &mut Segment {
        let needs_segment = self.segments.back().map_or(true, Segment::is_full);
        if needs_segment {
            let segment = self
                .spare
                .pop()
                .unwrap_or_else(|| Segment::new(self.segment_length));
            self.segments.push_back(segment);
        }
        // a segment was pushed above if there was none
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn push(&mut self, ids: &[u64]) {
        let mut rest = ids;
        while !rest.is_empty() {
            let segment = self.tail_segment_for_write();
            let room = segment.ids.len() - segment.high;
            let count = room.min(rest.len());
            segment.ids[segment.high..segment.high + count].copy_from_slice(&rest[..count]);
            segment.high += count;
            rest = &rest[count..];
        }
        self.size += ids.len();
    }

    fn recycle(&mut self, mut segment: Segment) {
        segment.low = 0;
        segment.high = 0;
        self.spare.push(segment);
    }
}

/// A growable queue of object IDs made of fixed-size segments.
///
/// IDs are produced at the head and consumed at the tail. Consumption is
/// two-step: [`ObjectIdMarkQueue::peek_batch`] copies IDs without removing
/// them, [`ObjectIdMarkQueue::advance`] removes them once processed. Fully
/// drained segments are kept for reuse.
///
/// The queue is shared between its owning channel (consumer) and every
/// channel that discovers references into it (producers).
#[derive(Debug)]
pub struct ObjectIdMarkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ObjectIdMarkQueue {
    /// Creates an empty queue with the given segment length.
    #[must_use]
    pub fn new(segment_length: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                segments: VecDeque::new(),
                spare: Vec::new(),
                size: 0,
                segment_length: segment_length.max(1),
            }),
            available: Condvar::new(),
        }
    }

    /// Appends one ID.
    pub fn enqueue(&self, id: u64) {
        self.enqueue_bulk(&[id]);
    }

    /// Appends several IDs in order.
    pub fn enqueue_bulk(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.state.lock().push(ids);
        self.available.notify_all();
    }

    /// Copies up to `buffer.len()` IDs from the tail into `buffer` without
    /// removing them. Returns the number copied.
    pub fn peek_batch(&self, buffer: &mut [u64]) -> usize {
        let state = self.state.lock();
        let mut copied = 0;
        for segment in &state.segments {
            if copied == buffer.len() {
                break;
            }
            let count = segment.len().min(buffer.len() - copied);
            buffer[copied..copied + count]
                .copy_from_slice(&segment.ids[segment.low..segment.low + count]);
            copied += count;
        }
        copied
    }

    /// Removes `count` IDs from the tail. Returns the number actually
    /// removed, which is smaller only if the queue held fewer IDs.
    pub fn advance(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let mut remaining = count.min(state.size);
        let removed = remaining;
        while remaining > 0 {
            let Some(front) = state.segments.front_mut() else {
                break;
            };
            let step = front.len().min(remaining);
            front.low += step;
            remaining -= step;
            let drained = front.low == front.high && front.is_full();
            if drained {
                if let Some(segment) = state.segments.pop_front() {
                    state.recycle(segment);
                }
            }
        }
        state.size -= removed;
        removed
    }

    /// Number of queued IDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().size
    }

    /// Returns true if no ID is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued ID, keeping the segments for reuse.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        while let Some(segment) = state.segments.pop_front() {
            state.recycle(segment);
        }
        state.size = 0;
    }

    /// Blocks until the queue holds IDs or `timeout` elapses. Returns true
    /// if IDs are available.
    pub fn wait_for_elements(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.size > 0 {
            return true;
        }
        let _ = self.available.wait_for(&mut state, timeout);
        state.size > 0
    }
}

impl Default for ObjectIdMarkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_across_segments() {
        let queue = ObjectIdMarkQueue::new(3);
        queue.enqueue_bulk(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(queue.len(), 7);

        let mut buffer = [0u64; 5];
        assert_eq!(queue.peek_batch(&mut buffer), 5);
        assert_eq!(buffer, [1, 2, 3, 4, 5]);
        assert_eq!(queue.len(), 7);

        assert_eq!(queue.advance(5), 5);
        let mut rest = [0u64; 10];
        assert_eq!(queue.peek_batch(&mut rest), 2);
        assert_eq!(&rest[..2], &[6, 7]);
    }

    #[test]
    fn advance_never_exceeds_size() {
        let queue = ObjectIdMarkQueue::new(4);
        queue.enqueue_bulk(&[1, 2]);
        assert_eq!(queue.advance(10), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn drained_segments_are_reused() {
        let queue = ObjectIdMarkQueue::new(2);
        for round in 0..5u64 {
            queue.enqueue_bulk(&[round, round + 100, round + 200]);
            let mut buffer = [0u64; 3];
            assert_eq!(queue.peek_batch(&mut buffer), 3);
            assert_eq!(buffer, [round, round + 100, round + 200]);
            queue.advance(3);
        }
        let state = queue.state.lock();
        assert!(state.segments.len() + state.spare.len() <= 3);
    }

    #[test]
    fn reset_clears() {
        let queue = ObjectIdMarkQueue::new(2);
        queue.enqueue_bulk(&[1, 2, 3]);
        queue.reset();
        assert!(queue.is_empty());
        queue.enqueue(9);
        let mut buffer = [0u64; 1];
        assert_eq!(queue.peek_batch(&mut buffer), 1);
        assert_eq!(buffer[0], 9);
    }

    #[test]
    fn wait_wakes_on_enqueue() {
        let queue = Arc::new(ObjectIdMarkQueue::new(8));
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(42);
        });

        assert!(queue.wait_for_elements(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(!ObjectIdMarkQueue::new(8).wait_for_elements(Duration::from_millis(5)));
    }

    proptest! {
        #[test]
        fn behaves_like_a_fifo(
            segment_length in 1usize..8,
            ops in prop::collection::vec((prop::collection::vec(any::<u64>(), 0..10), 0usize..12), 1..30),
        ) {
            let queue = ObjectIdMarkQueue::new(segment_length);
            let mut model = VecDeque::new();
            for (ids, consume) in ops {
                queue.enqueue_bulk(&ids);
                model.extend(ids);

                let mut buffer = vec![0u64; consume];
                let copied = queue.peek_batch(&mut buffer);
                prop_assert_eq!(copied, consume.min(model.len()));
                for (i, id) in buffer[..copied].iter().enumerate() {
                    prop_assert_eq!(*id, model[i]);
                }
                prop_assert_eq!(queue.advance(copied), copied);
                model.drain(..copied);
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}
