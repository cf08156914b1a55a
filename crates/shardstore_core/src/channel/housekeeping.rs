//! Background maintenance between tasks.

use super::Channel;
use crate::error::CoreResult;
use std::time::Instant;
use tracing::trace;

impl Channel {
    /// Runs file cleanup, GC and the cache check, each within the
    /// housekeeping budget, if the interval has passed since the last run.
    pub(crate) fn run_housekeeping(&mut self) -> CoreResult<()> {
        if self.files.is_none() || self.last_housekeeping.elapsed() < self.housekeeping.interval {
            return Ok(());
        }
        let budget = self.housekeeping.time_budget;
        let (cache, files) = self.parts()?;

        let cleaned = files.incremental_cleanup(cache, Some(Instant::now() + budget))?;
        let collected = cache.incremental_gc(files, Some(Instant::now() + budget), None)?;
        let checked = cache.incremental_cache_check(None, Some(Instant::now() + budget));

        trace!(channel = self.index, cleaned, collected, checked, "housekeeping");
        self.last_housekeeping = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::channel;
    use crate::binary::encode_entity;
    use crate::types::ObjectId;
    use std::time::Duration;

    #[test]
    fn housekeeping_waits_for_the_interval() {
        let (mut channel, harness) = channel(Duration::from_secs(3600));
        channel.analyze().unwrap();
        channel.initialize(0, 1).unwrap();
        let data = encode_entity(crate::live::initializer::tests::LEAF, ObjectId(1), b"a");
        channel.write(5, &data, false).unwrap();
        channel.commit_write(&data).unwrap();
        channel.finish_write();

        channel.run_housekeeping().unwrap();
        // the unrooted entity survives: no GC step ran yet
        assert!(channel.cache.contains(ObjectId(1)));
        assert_eq!(harness.stats.snapshot().sweeps, 0);
    }

    #[test]
    fn housekeeping_collects_unreachable_entities() {
        let (mut channel, harness) = channel(Duration::ZERO);
        channel.analyze().unwrap();
        channel.initialize(0, 1).unwrap();
        let data = encode_entity(crate::live::initializer::tests::LEAF, ObjectId(1), b"a");
        channel.write(5, &data, false).unwrap();
        channel.commit_write(&data).unwrap();
        channel.finish_write();

        for _ in 0..4 {
            channel.run_housekeeping().unwrap();
        }
        assert!(!channel.cache.contains(ObjectId(1)));
        assert!(harness.stats.snapshot().sweeps >= 2);
    }
}
