use std::fmt::Display;

use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// An integer ID, used for identification of sessions, requests and router-side resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(1);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    pub fn value(&self) -> u64 {
        self.0
    }

    fn next(&self) -> Id {
        if self.0 >= Self::MAX.0 {
            Self::MIN
        } else {
            Id(self.0 + 1)
        }
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::MIN
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 || value > Self::MAX.0 {
            Err(IdOutOfRange { value })
        } else {
            Ok(Id(value))
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .ok()
            .and_then(|v| Id::try_from(v).ok())
            .ok_or_else(|| E::invalid_value(Unexpected::Signed(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An ID allocator that generates session-scoped request IDs sequentially.
///
/// Starts at [`Id::MIN`], wraps from [`Id::MAX`] back to [`Id::MIN`], and skips any ID the caller
/// reports as still in use.
#[derive(Debug, Default)]
pub struct SequentialIdAllocator {
    next: Id,
}

impl SequentialIdAllocator {
    /// Generates a new ID for which `in_use` returns false.
    ///
    /// Returns [`None`] only if every ID in the range is in use.
    pub fn generate_id<F>(&mut self, in_use: F) -> Option<Id>
    where
        F: Fn(Id) -> bool,
    {
        let start = self.next;
        let mut id = start;
        loop {
            let next = id.next();
            if !in_use(id) {
                self.next = next;
                return Some(id);
            }
            if next == start {
                return None;
            }
            id = next;
        }
    }

    /// Resets the allocator to its initial state.
    pub fn reset(&mut self) {
        self.next = Id::MIN;
    }
}
