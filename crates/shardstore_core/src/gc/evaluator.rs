//! Entity cache eviction policy.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// What the cache policy gets to see of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCandidate {
    /// Length of the cached (or about to be cached) record.
    pub cached_length: i64,
    /// Last time the entity was stored or loaded, in epoch milliseconds.
    pub last_touched_ms: i64,
    /// Whether the entity's type has references.
    pub has_references: bool,
}

/// Decides whether an entity's cached bytes should be dropped.
///
/// Runs on the channel thread for every cached entity in a cache check, so
/// implementations must be total: no panics, no side effects.
pub trait EntityCacheEvaluator: Send + Sync + fmt::Debug {
    /// Returns true if the entity's cached data should be cleared.
    fn clear_entity_cache(&self, total_cache_size: i64, evaluation_time_ms: i64, entity: &CacheCandidate)
        -> bool;
}

/// Returns true if freshly stored or loaded data should stay cached.
///
/// `total_cache_size` must already include the candidate's length.
pub fn initially_cache_entity(
    evaluator: &dyn EntityCacheEvaluator,
    total_cache_size: i64,
    evaluation_time_ms: i64,
    entity: &CacheCandidate,
) -> bool {
    !evaluator.clear_entity_cache(total_cache_size, evaluation_time_ms, entity)
}

/// Default cache threshold: 1 GB of cached records.
pub const DEFAULT_CACHE_THRESHOLD: i64 = 1_000_000_000;

/// Default hard age limit: one day.
pub const DEFAULT_TIMEOUT_MS: i64 = 86_400_000;

/// The default eviction policy.
///
/// Each entity gets a weight of `cachedLength * (ageMs >> 16)`, doubled for
/// entities without references, so large leaf data goes first. An entity is
/// evicted when its weight exceeds the free cache budget
/// (`threshold - totalCacheSize`) or when it is older than the timeout.
///
/// The shift is an arithmetic (signed) shift: entities "touched in the
/// future" because of clock adjustments get a negative weight and are kept.
/// All arithmetic wraps instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCacheEvaluator {
    timeout_ms: i64,
    threshold: i64,
}

impl DefaultCacheEvaluator {
    /// Creates an evaluator.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error if either value is below 1.
    pub fn new(timeout_ms: i64, threshold: i64) -> CoreResult<Self> {
        let evaluator = Self {
            timeout_ms,
            threshold,
        };
        evaluator.validate()?;
        Ok(evaluator)
    }

    /// Checks the configured values.
    ///
    /// # Errors
    ///
    /// Returns an invalid configuration error if either value is below 1.
    pub fn validate(&self) -> CoreResult<()> {
        if self.timeout_ms < 1 {
            return Err(CoreError::invalid_config(format!(
                "cache timeout {} must be at least 1 ms",
                self.timeout_ms
            )));
        }
        if self.threshold < 1 {
            return Err(CoreError::invalid_config(format!(
                "cache threshold {} must be at least 1",
                self.threshold
            )));
        }
        Ok(())
    }

    /// The hard age limit in milliseconds.
    #[must_use]
    pub const fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// The cache size threshold.
    #[must_use]
    pub const fn threshold(&self) -> i64 {
        self.threshold
    }
}

impl Default for DefaultCacheEvaluator {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            threshold: DEFAULT_CACHE_THRESHOLD,
        }
    }
}

impl EntityCacheEvaluator for DefaultCacheEvaluator {
    fn clear_entity_cache(&self, total_cache_size: i64, evaluation_time_ms: i64, entity: &CacheCandidate) -> bool {
        let age = evaluation_time_ms.wrapping_sub(entity.last_touched_ms);
        if age >= self.timeout_ms {
            return true;
        }

        let shift = if entity.has_references { 0 } else { 1 };
        let weight = entity.cached_length.wrapping_mul(age >> 16).wrapping_shl(shift);
        self.threshold.wrapping_sub(total_cache_size) < weight
    }
}
