//! Whole-keyspace interval map with insertion splitting.
//!
//! The map assigns a value to every key of the addressable keyspace. It is
//! stored as a sorted set of boundary keys; each boundary owns the interval
//! up to the next boundary (the last one runs to the keyspace terminal).
//! Inserting a range replaces exactly that range's coverage: an existing
//! entry straddling an inserted boundary is split, with the pieces outside
//! the insertion keeping the old value.
//!
//! Invariants:
//! - a boundary always exists at the empty key;
//! - adjacent entries never overlap (they cannot, by construction);
//! - `insert` never changes coverage outside the inserted range.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use crate::keyspace::{terminal_key, Key, KeyRange};

pub struct RangeMap<V> {
    map: BTreeMap<Key, V>,
}

impl<V: Clone> RangeMap<V> {
    /// A map assigning `default` to the entire keyspace.
    pub fn new(default: V) -> Self {
        let mut map = BTreeMap::new();
        map.insert(Key::new(), default);
        RangeMap { map }
    }

    fn boundary_at_or_before(&self, key: &Key) -> &Key {
        let (k, _) = self
            .map
            .range::<[u8], _>((Unbounded, Included(key.as_ref())))
            .next_back()
            .expect("range map always has a boundary at the empty key");
        k
    }

    fn end_of(&self, begin: &Key) -> Key {
        self.map
            .range::<[u8], _>((Excluded(begin.as_ref()), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(terminal_key)
    }

    /// The entry whose range contains `key`. `key` must be below the keyspace
    /// terminal.
    pub fn range_containing(&self, key: &Key) -> (KeyRange, &V) {
        let begin = self.boundary_at_or_before(key).clone();
        let end = self.end_of(&begin);
        let value = &self.map[&begin];
        (KeyRange { begin, end }, value)
    }

    /// Mutable access to the value covering `key`.
    pub fn value_containing_mut(&mut self, key: &Key) -> (KeyRange, &mut V) {
        let begin = self.boundary_at_or_before(key).clone();
        let end = self.end_of(&begin);
        let value = self
            .map
            .get_mut(&begin)
            .expect("boundary resolved above is present");
        (KeyRange { begin, end }, value)
    }

    /// Insert `value` over `range`, splitting any straddling entries so that
    /// coverage outside `range` is unchanged. Empty ranges are ignored.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        debug_assert!(range.end <= terminal_key());
        // Preserve the tail of an entry straddling `range.end`.
        if range.end < terminal_key() && !self.map.contains_key(&range.end) {
            let (_, tail) = self.range_containing(&range.end);
            let tail = tail.clone();
            self.map.insert(range.end.clone(), tail);
        }
        // Drop boundaries interior to the inserted range.
        let interior: Vec<Key> = self
            .map
            .range::<[u8], _>((Excluded(range.begin.as_ref()), Excluded(range.end.as_ref())))
            .map(|(k, _)| k.clone())
            .collect();
        for k in interior {
            self.map.remove(&k);
        }
        self.map.insert(range.begin.clone(), value);
    }

    /// All entries whose range intersects `range`, with their full
    /// (unclipped) ranges.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        if range.is_empty() {
            return Vec::new();
        }
        let first = self.boundary_at_or_before(&range.begin).clone();
        self.map
            .range::<[u8], _>((Included(first.as_ref()), Excluded(range.end.as_ref())))
            .map(|(k, v)| {
                let end = self.end_of(k);
                (KeyRange { begin: k.clone(), end }, v)
            })
            .collect()
    }

    /// Apply `f` to every entry intersecting `range`.
    pub fn for_each_intersecting_mut(
        &mut self,
        range: &KeyRange,
        mut f: impl FnMut(&KeyRange, &mut V),
    ) {
        if range.is_empty() {
            return;
        }
        let keys: Vec<Key> = {
            let first = self.boundary_at_or_before(&range.begin).clone();
            self.map
                .range::<[u8], _>((Included(first.as_ref()), Excluded(range.end.as_ref())))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for begin in keys {
            let end = self.end_of(&begin);
            if let Some(v) = self.map.get_mut(&begin) {
                f(&KeyRange { begin: begin.clone(), end }, v);
            }
        }
    }

    /// Entries lying entirely inside `range`.
    pub fn contained(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        self.intersecting(range)
            .into_iter()
            .filter(|(r, _)| range.contains(r))
            .collect()
    }

    /// Every entry in the map, in key order.
    pub fn ranges(&self) -> Vec<(KeyRange, &V)> {
        self.map
            .iter()
            .map(|(k, v)| {
                let end = self.end_of(k);
                (KeyRange { begin: k.clone(), end }, v)
            })
            .collect()
    }

    /// The ordered list of ranges that would exist after `insert(range, _)`
    /// and whose extent is affected by it: the truncated head of an entry
    /// straddling `range.begin`, `range` itself, and the truncated tail of an
    /// entry straddling `range.end`. Used to requeue split-off pieces and to
    /// compute the full span touched by an insertion.
    pub fn affected_ranges_after_insertion(&self, range: &KeyRange) -> Vec<KeyRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(3);
        let (first, _) = self.range_containing(&range.begin);
        if first.begin != range.begin {
            out.push(KeyRange {
                begin: first.begin,
                end: range.begin.clone(),
            });
        }
        out.push(range.clone());
        if range.end < terminal_key() {
            let (last, _) = self.range_containing(&range.end);
            if last.begin != range.end {
                out.push(KeyRange {
                    begin: range.end.clone(),
                    end: last.end,
                });
            }
        }
        out
    }
}
