//! Keyspace-covering interval map.
//!
//! `RangeMap` partitions a fixed key span into contiguous ranges, each
//! carrying a value. The resolver routing map and the key→storage-tags map
//! are both instances of it. Boundaries live in a `BTreeMap` keyed by range
//! begin, giving O(log n) point lookup and O(k) enumeration of the k ranges
//! intersecting a query range.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::types::KeyRange;

/// Interval map covering `[begin_of_space, end_of_space)` with no gaps.
#[derive(Clone, Debug)]
pub struct RangeMap<T> {
    entries: BTreeMap<Bytes, T>,
    end: Bytes,
}

impl<T: Clone> RangeMap<T> {
    /// A map whose entire span carries `default`.
    pub fn new(span: KeyRange, default: T) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(span.begin, default);
        Self {
            entries,
            end: span.end,
        }
    }

    /// Number of distinct ranges.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clamp(&self, range: &KeyRange) -> Option<KeyRange> {
        let begin_of_space = self
            .entries
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(Bytes::new);
        let begin = range.begin.clone().max(begin_of_space);
        let end = range.end.clone().min(self.end.clone());
        if begin >= end {
            None
        } else {
            Some(KeyRange::new(begin, end))
        }
    }

    /// End boundary of the range starting at `begin`.
    fn end_of(&self, begin: &Bytes) -> Bytes {
        use std::ops::Bound::{Excluded, Unbounded};
        self.entries
            .range::<Bytes, _>((Excluded(begin.clone()), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| self.end.clone())
    }

    /// The range containing `key` and its value.
    pub fn range_containing(&self, key: &[u8]) -> (KeyRange, &T) {
        use std::ops::Bound::{Included, Unbounded};
        let (begin, value) = self
            .entries
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .unwrap_or_else(|| self.entries.iter().next().expect("range map is never empty"));
        let begin = begin.clone();
        let end = self.end_of(&begin);
        (KeyRange::new(begin, end), value)
    }

    /// Value at `key`.
    pub fn get(&self, key: &[u8]) -> &T {
        self.range_containing(key).1
    }

    /// The range containing the largest key strictly before `key`.
    pub fn range_containing_key_before(&self, key: &[u8]) -> (KeyRange, &T) {
        use std::ops::Bound::{Excluded, Unbounded};
        let (begin, value) = self
            .entries
            .range::<[u8], _>((Unbounded, Excluded(key)))
            .next_back()
            .unwrap_or_else(|| self.entries.iter().next().expect("range map is never empty"));
        let begin = begin.clone();
        let end = self.end_of(&begin);
        (KeyRange::new(begin, end), value)
    }

    /// All ranges intersecting `range`, unclipped, in key order.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, &T)> {
        let Some(clamped) = self.clamp(range) else {
            return Vec::new();
        };
        let first_begin = self.range_containing(&clamped.begin).0.begin;
        self.entries
            .range::<Bytes, _>(first_begin..)
            .take_while(|(begin, _)| **begin < clamped.end)
            .map(|(begin, value)| {
                let end = self.end_of(begin);
                (KeyRange::new(begin.clone(), end), value)
            })
            .collect()
    }

    /// All ranges in key order.
    pub fn iter(&self) -> impl Iterator<Item = (KeyRange, &T)> {
        self.entries.iter().map(|(begin, value)| {
            let end = self.end_of(begin);
            (KeyRange::new(begin.clone(), end), value)
        })
    }

    /// Split boundaries so `range` begins and ends exactly on boundaries, and
    /// return mutable access to every range inside it, in key order.
    pub fn modify(&mut self, range: &KeyRange) -> Vec<&mut T> {
        let Some(clamped) = self.clamp(range) else {
            return Vec::new();
        };
        self.split_at(&clamped.begin);
        self.split_at(&clamped.end);
        self.entries
            .range_mut::<Bytes, _>(clamped.begin..clamped.end)
            .map(|(_, value)| value)
            .collect()
    }

    /// Replace everything in `range` with a single entry carrying `value`.
    pub fn insert(&mut self, range: &KeyRange, value: T) {
        let Some(clamped) = self.clamp(range) else {
            return;
        };
        self.split_at(&clamped.begin);
        self.split_at(&clamped.end);
        let stale: Vec<Bytes> = self
            .entries
            .range::<Bytes, _>(clamped.begin.clone()..clamped.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
        }
        self.entries.insert(clamped.begin, value);
    }

    fn split_at(&mut self, key: &Bytes) {
        if *key >= self.end || self.entries.contains_key(key) {
            return;
        }
        if let Some((_, value)) = self.entries.range::<Bytes, _>(..key.clone()).next_back() {
            let cloned = value.clone();
            self.entries.insert(key.clone(), cloned);
        }
    }
}

impl<T: Clone + PartialEq> RangeMap<T> {
    /// Merge adjacent ranges with equal values.
    pub fn coalesce(&mut self) {
        let mut stale = Vec::new();
        let mut prev: Option<(&Bytes, &T)> = None;
        for (begin, value) in &self.entries {
            if let Some((_, prev_value)) = prev {
                if prev_value == value {
                    stale.push(begin.clone());
                    continue;
                }
            }
            prev = Some((begin, value));
        }
        for key in stale {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::all_keys;

    fn range(begin: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end))
    }

    #[test]
    fn new_map_covers_the_span_with_the_default() {
        let map = RangeMap::new(all_keys(), 0u32);
        assert_eq!(map.len(), 1);
        let (r, v) = map.range_containing(b"anything");
        assert_eq!(*v, 0);
        assert_eq!(r, all_keys());
    }

    #[test]
    fn insert_splits_and_replaces() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&range(b"b", b"d"), 1);
        assert_eq!(map.len(), 3);
        assert_eq!(*map.get(b"a"), 0);
        assert_eq!(*map.get(b"b"), 1);
        assert_eq!(*map.get(b"c"), 1);
        assert_eq!(*map.get(b"d"), 0);
        // Overlapping insert swallows the middle boundary.
        map.insert(&range(b"c", b"e"), 2);
        assert_eq!(*map.get(b"b"), 1);
        assert_eq!(*map.get(b"c"), 2);
        assert_eq!(*map.get(b"d"), 2);
        assert_eq!(*map.get(b"e"), 0);
    }

    #[test]
    fn modify_exposes_exactly_the_covered_ranges() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&range(b"b", b"d"), 1);
        for value in map.modify(&range(b"c", b"f")) {
            *value += 10;
        }
        assert_eq!(*map.get(b"b"), 1);
        assert_eq!(*map.get(b"c"), 11);
        assert_eq!(*map.get(b"d"), 10);
        assert_eq!(*map.get(b"f"), 0);
    }

    #[test]
    fn intersecting_returns_unclipped_ranges() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&range(b"b", b"d"), 1);
        map.insert(&range(b"d", b"f"), 2);
        let hits = map.intersecting(&range(b"c", b"e"));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, range(b"b", b"d"));
        assert_eq!(*hits[0].1, 1);
        assert_eq!(hits[1].0, range(b"d", b"f"));
        assert_eq!(*hits[1].1, 2);
        assert!(map.intersecting(&range(b"x", b"x")).is_empty());
    }

    #[test]
    fn coalesce_merges_equal_neighbors() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&range(b"b", b"d"), 1);
        map.insert(&range(b"d", b"f"), 1);
        assert_eq!(map.len(), 4);
        map.coalesce();
        assert_eq!(map.len(), 3);
        assert_eq!(*map.get(b"c"), 1);
        assert_eq!(*map.get(b"e"), 1);
        assert_eq!(map.range_containing(b"c").0, range(b"b", b"f"));
    }

    #[test]
    fn range_containing_key_before_steps_back_over_boundaries() {
        let mut map = RangeMap::new(all_keys(), 0u32);
        map.insert(&range(b"b", b"d"), 1);
        let (r, v) = map.range_containing_key_before(b"b");
        assert_eq!(*v, 0);
        assert_eq!(r.end, Bytes::from_static(b"b"));
        let (r2, _) = map.range_containing_key_before(b"c");
        assert_eq!(r2, range(b"b", b"d"));
    }
}
