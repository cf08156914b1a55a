//! Garbage collection building blocks.
//!
//! Collection is an incremental, channel-parallel mark and sweep:
//!
//! - [`mark_queue`]: per-channel queues of object IDs awaiting marking
//! - [`monitor`]: cross-channel bookkeeping of marks in flight and sweep
//!   rounds
//! - [`evaluator`]: the entity cache eviction policy, run alongside GC by
//!   housekeeping
//!
//! The per-entity mark and sweep steps live with the entity cache.

pub mod evaluator;
pub mod mark_queue;
pub mod monitor;

pub use evaluator::{initially_cache_entity, CacheCandidate, DefaultCacheEvaluator, EntityCacheEvaluator};
pub use mark_queue::ObjectIdMarkQueue;
pub use monitor::{GcStatus, MarkMonitor, ReferenceMarker};
