//! Core type definitions.

use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a stored entity.
///
/// The low bits select the owning channel, see [`ObjectId::channel`].
/// The value 0 is the null reference and never names an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Creates an object ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the channel owning this ID for the given channel count.
    ///
    /// `channel_count` must be a power of two.
    #[inline]
    #[must_use]
    pub const fn channel(self, channel_count: usize) -> usize {
        (self.0 & (channel_count as u64 - 1)) as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of an entity type in the type dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct TypeId(pub u64);

impl TypeId {
    /// Creates a type ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

impl From<u64> for TypeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Maximum number of channels.
pub const MAX_CHANNEL_COUNT: usize = 1024;

/// Returns true if `count` is a valid channel count: a power of two in
/// `1..=1024`.
#[must_use]
pub const fn is_valid_channel_count(count: usize) -> bool {
    count >= 1 && count <= MAX_CHANNEL_COUNT && count.is_power_of_two()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn channel_count_bounds() {
        assert!(is_valid_channel_count(1));
        assert!(is_valid_channel_count(4));
        assert!(is_valid_channel_count(1024));
        for invalid in [0, 3, 5, 100, 1025, 2048] {
            assert!(!is_valid_channel_count(invalid), "{invalid}");
        }
    }

    #[test]
    fn object_id_display() {
        assert_eq!(ObjectId::new(42).to_string(), "oid:42");
        assert_eq!(TypeId::new(7).to_string(), "tid:7");
        assert!(ObjectId::NULL.is_null());
    }

    proptest! {
        #[test]
        fn channel_is_masked_low_bits(oid in any::<u64>(), shift in 0u32..=10) {
            let count = 1usize << shift;
            let channel = ObjectId(oid).channel(count);
            prop_assert!(channel < count);
            prop_assert_eq!(channel as u64, oid & (count as u64 - 1));
            prop_assert_eq!(channel as u64, oid % count as u64);
        }
    }
}
