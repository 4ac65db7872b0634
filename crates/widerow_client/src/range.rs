//! Row-key ranges and the pure helpers that build them.
//!
//! Every read that is not an explicit key lookup is expressed as one or more
//! `RowRange`s. Prefix reads become half-open ranges `[prefix, successor)`,
//! where the successor is the smallest key that sorts after every key with the
//! prefix. A prefix made only of `0xFF` bytes has no successor, so its range is
//! open-ended.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

/// One side of a row range.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyBound {
    /// Beginning or end of the keyspace.
    Unbounded,
    Inclusive(Bytes),
    Exclusive(Bytes),
}

impl KeyBound {
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Self::Unbounded => None,
            Self::Inclusive(key) | Self::Exclusive(key) => Some(key),
        }
    }

    /// `true` for `Unbounded` and `Inclusive`.
    pub fn is_inclusive(&self) -> bool {
        !matches!(self, Self::Exclusive(_))
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

/// Canonical row range descriptor. Never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RowRange {
    pub start: KeyBound,
    pub end: KeyBound,
}

impl RowRange {
    pub fn new(start: KeyBound, end: KeyBound) -> Self {
        Self { start, end }
    }

    /// The whole table.
    pub fn full() -> Self {
        Self::new(KeyBound::Unbounded, KeyBound::Unbounded)
    }

    /// `[start, end)`; an empty `end` means unbounded.
    pub fn closed_open(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        let end = end.into();
        Self::new(
            bound_or_unbounded(start.into(), KeyBound::Inclusive),
            bound_or_unbounded(end, KeyBound::Exclusive),
        )
    }

    /// `[start, end]`; empty keys mean unbounded.
    pub fn closed(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self::new(
            bound_or_unbounded(start.into(), KeyBound::Inclusive),
            bound_or_unbounded(end.into(), KeyBound::Inclusive),
        )
    }

    pub fn is_full(&self) -> bool {
        self.start.is_unbounded() && self.end.is_unbounded()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above_start = match &self.start {
            KeyBound::Unbounded => true,
            KeyBound::Inclusive(start) => key >= start.as_ref(),
            KeyBound::Exclusive(start) => key > start.as_ref(),
        };
        let below_end = match &self.end {
            KeyBound::Unbounded => true,
            KeyBound::Inclusive(end) => key <= end.as_ref(),
            KeyBound::Exclusive(end) => key < end.as_ref(),
        };
        above_start && below_end
    }

    /// Whether no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        let (Some(start), Some(end)) = (self.start.key(), self.end.key()) else {
            return false;
        };
        match start.cmp(end) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.start.is_inclusive() && self.end.is_inclusive()),
            Ordering::Less => false,
        }
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            KeyBound::Unbounded => write!(f, "(-inf")?,
            KeyBound::Inclusive(key) => write!(f, "[{}", hex::encode(key))?,
            KeyBound::Exclusive(key) => write!(f, "({}", hex::encode(key))?,
        }
        match &self.end {
            KeyBound::Unbounded => write!(f, ", +inf)"),
            KeyBound::Inclusive(key) => write!(f, ", {}]", hex::encode(key)),
            KeyBound::Exclusive(key) => write!(f, ", {})", hex::encode(key)),
        }
    }
}

fn bound_or_unbounded(key: Bytes, make: fn(Bytes) -> KeyBound) -> KeyBound {
    if key.is_empty() {
        KeyBound::Unbounded
    } else {
        make(key)
    }
}

/// Smallest key that sorts after every key starting with `prefix`.
///
/// Returns `None` when the prefix is empty or made only of `0xFF` bytes.
pub fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut out = prefix.to_vec();
    for idx in (0..out.len()).rev() {
        if out[idx] != 0xFF {
            out[idx] += 1;
            out.truncate(idx + 1);
            return Some(Bytes::from(out));
        }
    }
    None
}

/// `[prefix, successor(prefix))`, or `[prefix, +inf)` without a successor.
pub fn prefix_to_range(prefix: &[u8]) -> RowRange {
    if prefix.is_empty() {
        return RowRange::full();
    }
    let end = match prefix_successor(prefix) {
        Some(successor) => KeyBound::Exclusive(successor),
        None => KeyBound::Unbounded,
    };
    RowRange::new(KeyBound::Inclusive(Bytes::copy_from_slice(prefix)), end)
}

/// Range covering `start..=end` where either side may be missing.
pub fn bounds_to_range(start: Option<&Bytes>, end: Option<&Bytes>) -> RowRange {
    let start = start
        .filter(|key| !key.is_empty())
        .map(|key| KeyBound::Inclusive(key.clone()))
        .unwrap_or(KeyBound::Unbounded);
    let end = end
        .filter(|key| !key.is_empty())
        .map(|key| KeyBound::Inclusive(key.clone()))
        .unwrap_or(KeyBound::Unbounded);
    RowRange::new(start, end)
}

pub fn prefixes_to_ranges<'a, I>(prefixes: I) -> Vec<RowRange>
where
    I: IntoIterator<Item = &'a Bytes>,
{
    prefixes
        .into_iter()
        .map(|prefix| prefix_to_range(prefix))
        .collect()
}
