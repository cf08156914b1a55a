//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use crate::fixtures::RecordBuilder;
use proptest::prelude::*;
use shardstore_core::{ObjectId, TransactionEntry, MAX_CHANNEL_COUNT};
use std::collections::BTreeMap;

/// Strategy for generating non-null object IDs.
pub fn object_id_strategy() -> impl Strategy<Value = ObjectId> {
    (1..=u64::MAX).prop_map(ObjectId)
}

/// Strategy for generating valid channel counts (powers of two up to the
/// maximum).
pub fn channel_count_strategy() -> impl Strategy<Value = usize> {
    let max_exponent = MAX_CHANNEL_COUNT.trailing_zeros();
    (0..=max_exponent).prop_map(|exponent| 1usize << exponent)
}

/// Strategy for generating channel counts that must be rejected.
pub fn invalid_channel_count_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0usize),
        (1..=4 * MAX_CHANNEL_COUNT).prop_filter("not a power of two", |n| !n.is_power_of_two()),
        (MAX_CHANNEL_COUNT + 1..=usize::MAX / 2),
    ]
}

/// Strategy for generating entity payloads (arbitrary bytes).
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for generating stores: distinct small object IDs with their
/// payloads.
pub fn store_batch_strategy(max_entities: usize) -> impl Strategy<Value = BTreeMap<u64, Vec<u8>>> {
    prop::collection::btree_map(1..10_000u64, payload_strategy(), 1..max_entities.max(2))
}

/// Turns a generated store batch into leaf records.
pub fn batch_records(batch: &BTreeMap<u64, Vec<u8>>) -> Vec<u8> {
    batch
        .iter()
        .fold(RecordBuilder::new(), |builder, (id, payload)| builder.blob(*id, payload))
        .build()
}

/// Strategy for generating transactions log entries of every kind.
pub fn transaction_entry_strategy() -> impl Strategy<Value = TransactionEntry> {
    let timestamp = 0..i64::MAX;
    let length = 0..u64::MAX / 2;
    prop_oneof![
        (timestamp.clone(), length.clone(), 1..u64::MAX / 2).prop_map(|(timestamp, file_length, file_number)| {
            TransactionEntry::FileCreation {
                timestamp,
                file_length,
                file_number,
            }
        }),
        (timestamp.clone(), length.clone())
            .prop_map(|(timestamp, file_length)| TransactionEntry::Store { timestamp, file_length }),
        (timestamp.clone(), length.clone(), 1..u64::MAX / 2, length.clone()).prop_map(
            |(timestamp, file_length, source_file_number, source_offset)| TransactionEntry::Transfer {
                timestamp,
                file_length,
                source_file_number,
                source_offset,
            }
        ),
        (timestamp.clone(), length.clone(), 1..u64::MAX / 2, length.clone()).prop_map(
            |(timestamp, file_length, file_number, old_length)| TransactionEntry::FileTruncation {
                timestamp,
                file_length,
                file_number,
                old_length,
            }
        ),
        (timestamp, length, 1..u64::MAX / 2).prop_map(|(timestamp, file_length, file_number)| {
            TransactionEntry::FileDeletion {
                timestamp,
                file_length,
                file_number,
            }
        }),
    ]
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests, for properties that start
    /// a storage per case.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
