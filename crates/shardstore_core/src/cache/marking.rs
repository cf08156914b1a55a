//! Mark and sweep steps of one channel.

use super::entity::GcColor;
use super::{DataFileAccess, EntityCache, EntityKey};
use crate::controller::OperationController;
use crate::error::CoreResult;
use crate::types::ObjectId;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |deadline| Instant::now() >= deadline)
}

impl EntityCache {
    /// Colors a stored entity for the running GC cycle.
    ///
    /// While this channel still has to sweep, the entity must survive the
    /// sweep and is blackened. Otherwise its references have to be
    /// followed, so it is grayed and queued.
    pub(crate) fn mark_entity_for_changed_data(&mut self, key: EntityKey) {
        let pending_sweep = self.monitor.is_pending_sweep(self.channel);
        let Some(entity) = self.arena.get_mut(key) else {
            return;
        };
        if pending_sweep || !entity.has_references {
            entity.color = GcColor::Black;
        } else {
            entity.color = GcColor::Gray;
            self.monitor.enqueue(self.channel, entity.object_id);
        }
    }

    fn mark_object_id(&mut self, object_id: ObjectId, files: &dyn DataFileAccess) -> CoreResult<()> {
        let Some(key) = self.lookup(object_id) else {
            warn!(channel = self.channel, object_id = %object_id, "zombie object ID");
            self.stats.record_zombie_object_id();
            return Ok(());
        };
        let Some(entity) = self.arena.get_mut(key) else {
            return Ok(());
        };
        if entity.color == GcColor::Black {
            return Ok(());
        }
        entity.color = GcColor::Black;
        if !entity.has_references {
            return Ok(());
        }

        let type_id = entity.type_id;
        let record = match &entity.cached {
            Some(cached) => cached.clone(),
            None => Bytes::from(files.read_record(entity.file_number, entity.position, entity.length)?),
        };
        let Some(layout) = self.types.get(&type_id).map(|t| Arc::clone(&t.layout)) else {
            return Ok(());
        };
        let marker = &mut self.marker;
        layout.for_each_reference(&record, |reference| marker.mark(reference))
    }

    /// Processes queued mark IDs in batches until the queue is empty or the
    /// deadline passes. Returns true if any ID was processed.
    pub(crate) fn incremental_mark(&mut self, files: &dyn DataFileAccess, deadline: Option<Instant>) -> CoreResult<bool> {
        let queue = Arc::clone(self.monitor.queue(self.channel));
        let mut processed = false;
        loop {
            let count = queue.peek_batch(&mut self.mark_buffer);
            if count == 0 {
                break;
            }
            processed = true;
            for index in 0..count {
                let object_id = ObjectId(self.mark_buffer[index]);
                self.mark_object_id(object_id, files)?;
            }
            // references must be counted as pending before the batch is
            // released, or marking could look complete too early
            self.marker.flush();
            self.monitor.advance_marking(self.channel, count)?;
            if expired(deadline) {
                break;
            }
        }
        Ok(processed)
    }

    /// Removes every unmarked entity and resets the survivors to white.
    pub(crate) fn sweep(&mut self, files: &mut dyn DataFileAccess) -> CoreResult<u64> {
        let root_type = self.dictionary.root_type_id();
        let type_ids: Vec<_> = self.types.keys().copied().collect();
        let mut swept = 0u64;
        let mut root = ObjectId::NULL;

        for type_id in type_ids {
            for key in self.keys_of_type(type_id) {
                let Some(entity) = self.arena.get_mut(key) else {
                    continue;
                };
                if entity.color.is_marked() {
                    entity.color = GcColor::White;
                    if Some(type_id) == root_type {
                        root = root.max(entity.object_id);
                    }
                } else {
                    self.unregister(key, files)?;
                    swept += 1;
                }
            }
        }

        self.stats.record_sweep(swept);
        debug!(channel = self.channel, swept, remaining = self.entity_count(), "sweep complete");
        self.monitor.complete_sweep(self.channel, root)?;
        Ok(swept)
    }

    /// Runs the collector until it completes for this channel or the
    /// deadline passes. Returns true if GC is complete.
    ///
    /// With `wait_for_marks`, a channel that has nothing to mark waits on
    /// its queue for marks from other channels while the controller runs;
    /// without it, the call returns as soon as there is no local work.
    pub(crate) fn incremental_gc(
        &mut self,
        files: &mut dyn DataFileAccess,
        deadline: Option<Instant>,
        wait_for_marks: Option<&OperationController>,
    ) -> CoreResult<bool> {
        loop {
            if self.monitor.is_complete(self.channel) {
                return Ok(true);
            }
            if expired(deadline) {
                return Ok(false);
            }
            if self.monitor.needs_sweep(self.channel)? {
                self.sweep(files)?;
                continue;
            }
            if self.incremental_mark(files, deadline)? {
                continue;
            }
            match wait_for_marks {
                Some(controller) if controller.is_running() => {}
                _ => return Ok(false),
            }
            self.monitor
                .queue(self.channel)
                .wait_for_elements(self.marking_wait);
        }
    }
}
