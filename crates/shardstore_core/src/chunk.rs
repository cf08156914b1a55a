//! Splitting caller data into per-channel partitions.

use crate::binary::{RecordIter, RecordKind};
use crate::dictionary::TypeDictionary;
use crate::error::{CoreError, CoreResult};

/// What to do with gap records in incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GapPolicy {
    /// Gaps are invalid: stores carry entities only.
    Reject,
    /// Gaps are dropped: imported data files may contain them.
    Skip,
}

/// Validated records of one or more chunks, split by channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Partitions {
    channels: Vec<Vec<u8>>,
    entity_count: usize,
}

impl Partitions {
    /// Records belonging to `channel`, concatenated in input order.
    pub(crate) fn channel(&self, channel: usize) -> &[u8] {
        self.channels.get(channel).map_or(&[], Vec::as_slice)
    }

    /// Number of entity records.
    pub(crate) const fn entity_count(&self) -> usize {
        self.entity_count
    }

    /// Total length of all entity records.
    pub(crate) fn byte_count(&self) -> u64 {
        self.channels.iter().map(|data| data.len() as u64).sum()
    }
}

/// Validates every record of `chunks` and assigns it to its channel.
///
/// # Errors
///
/// Returns a validation error for a garbled record, a gap under
/// [`GapPolicy::Reject`], an unknown type or a record its type layout
/// rejects. Nothing is partitioned if any record fails.
pub(crate) fn partition<'a>(
    chunks: impl IntoIterator<Item = &'a [u8]>,
    channel_count: usize,
    dictionary: &dyn TypeDictionary,
    gaps: GapPolicy,
) -> CoreResult<Partitions> {
    let mut channels = vec![Vec::new(); channel_count];
    let mut entity_count = 0;
    for chunk in chunks {
        for record in RecordIter::new(chunk, 0) {
            let record = record.map_err(|e| CoreError::validation(e.to_string()))?;
            let header = match record.kind {
                RecordKind::Entity(header) => header,
                RecordKind::Gap(_) if gaps == GapPolicy::Skip => continue,
                RecordKind::Gap(length) => {
                    return Err(CoreError::validation(format!(
                        "gap of {length} bytes at {} in entity data",
                        record.offset
                    )))
                }
            };
            let layout = dictionary.layout(header.type_id).ok_or_else(|| {
                CoreError::validation(format!(
                    "{} at {} has unknown type {}",
                    header.object_id, record.offset, header.type_id
                ))
            })?;
            layout.validate(header.length, header.object_id)?;

            let start = record.offset as usize;
            let end = start + header.length as usize;
            channels[header.object_id.channel(channel_count)].extend_from_slice(&chunk[start..end]);
            entity_count += 1;
        }
    }
    Ok(Partitions {
        channels,
        entity_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{encode_entity, encode_gap};
    use crate::dictionary::{SimpleTypeDictionary, TypeLayout};
    use crate::types::{ObjectId, TypeId};
    use proptest::prelude::*;

    const T: TypeId = TypeId(10);

    fn dictionary() -> SimpleTypeDictionary {
        let dictionary = SimpleTypeDictionary::new();
        dictionary
            .register(TypeLayout::new(T, "T").with_content_length(0, 64))
            .unwrap();
        dictionary
    }

    fn chunk(ids: &[u64]) -> Vec<u8> {
        ids.iter()
            .flat_map(|id| encode_entity(T, ObjectId(*id), &id.to_le_bytes()))
            .collect()
    }

    #[test]
    fn records_go_to_their_channel_in_order() {
        let data = chunk(&[1, 2, 5, 4, 9]);
        let partitions = partition([data.as_slice()], 4, &dictionary(), GapPolicy::Reject).unwrap();
        assert_eq!(partitions.entity_count(), 5);
        assert_eq!(partitions.channel(1), chunk(&[1, 5, 9]).as_slice());
        assert_eq!(partitions.channel(0), chunk(&[4]).as_slice());
        assert_eq!(partitions.channel(2), chunk(&[2]).as_slice());
        assert!(partitions.channel(3).is_empty());
        assert_eq!(partitions.byte_count(), data.len() as u64);
    }

    #[test]
    fn gaps_follow_the_policy() {
        let mut data = chunk(&[1]);
        data.extend(encode_gap(16));
        data.extend(chunk(&[2]));

        let error = partition([data.as_slice()], 1, &dictionary(), GapPolicy::Reject).unwrap_err();
        assert!(error.is_validation());

        let partitions = partition([data.as_slice()], 1, &dictionary(), GapPolicy::Skip).unwrap();
        assert_eq!(partitions.channel(0), chunk(&[1, 2]).as_slice());
    }

    #[test]
    fn invalid_records_are_rejected() {
        let dictionary = dictionary();
        let unknown = encode_entity(TypeId(99), ObjectId(1), b"");
        let null = encode_entity(T, ObjectId::NULL, b"");
        let too_long = encode_entity(T, ObjectId(1), &[0; 65]);
        let mut truncated = chunk(&[1]);
        truncated.pop();

        for data in [unknown, null, too_long, truncated, vec![0; 8]] {
            let error = partition([data.as_slice()], 2, &dictionary, GapPolicy::Skip).unwrap_err();
            assert!(error.is_validation(), "{error}");
        }
    }

    proptest! {
        #[test]
        fn partitions_keep_every_record(ids in prop::collection::vec(1u64..10_000, 0..64), shift in 0u32..5) {
            let channel_count = 1usize << shift;
            let data = chunk(&ids);
            let partitions = partition([data.as_slice()], channel_count, &dictionary(), GapPolicy::Reject).unwrap();
            prop_assert_eq!(partitions.entity_count(), ids.len());
            prop_assert_eq!(partitions.byte_count(), data.len() as u64);
            for channel in 0..channel_count {
                let expected: Vec<u64> = ids.iter().copied().filter(|id| ObjectId(*id).channel(channel_count) == channel).collect();
                let want = chunk(&expected);
                prop_assert_eq!(partitions.channel(channel), want.as_slice());
            }
        }
    }
}
