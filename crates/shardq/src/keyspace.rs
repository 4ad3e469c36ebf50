//! Keys and key ranges. Keys are lexicographically ordered byte strings,
//! ranges are end-exclusive, and the addressable keyspace ends at a fixed
//! terminal key that no user key may reach.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A key in the keyspace. Cheap to clone.
pub type Key = Bytes;

/// Exclusive upper bound of the addressable keyspace. Every range handled by
/// the queue ends at or before this key.
pub fn terminal_key() -> Key {
    Bytes::from_static(&[0xff, 0xff])
}

/// A half-open key interval `[begin, end)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        KeyRange {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The whole addressable keyspace.
    pub fn all() -> Self {
        KeyRange {
            begin: Bytes::new(),
            end: terminal_key(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        *key >= self.begin && *key < self.end
    }

    /// True if `other` lies entirely within `self`.
    pub fn contains(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

fn fmt_key(f: &mut fmt::Formatter<'_>, key: &Key) -> fmt::Result {
    if key.iter().all(|b| b.is_ascii_graphic()) && !key.is_empty() {
        // SAFETY of lossless display: all graphic ASCII.
        write!(f, "{}", String::from_utf8_lossy(key))
    } else if key.is_empty() {
        write!(f, "''")
    } else {
        for b in key.iter() {
            write!(f, "\\x{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        fmt_key(f, &self.begin)?;
        write!(f, ", ")?;
        fmt_key(f, &self.end)?;
        write!(f, ")")
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
