//! Shared scalar types: versions, storage tags, priorities, and key ranges.
//!
//! These are kept in a small, dependency-light module because they are used by
//! both proxy roles and by every collaborator contract.

use bytes::Bytes;

/// Database version. Versions are assigned by the master and advance roughly
/// one million per second of wall clock.
pub type Version = i64;

/// Sentinel for "no version".
pub const INVALID_VERSION: Version = -1;

/// Nominal rate at which the master advances the version clock.
pub const VERSIONS_PER_SECOND: i64 = 1_000_000;

/// Client-visible transaction throttling tag (arbitrary short byte string).
pub type TransactionTag = Bytes;

/// Locality value for tags that do not belong to a storage server.
pub const TAG_LOCALITY_SPECIAL: i8 = -1;
/// Locality of log-router tags.
pub const TAG_LOCALITY_LOG_ROUTER: i8 = -2;
/// Locality of remote-DC log tags; used when popping the txs stream remotely.
pub const TAG_LOCALITY_REMOTE_LOG: i8 = -3;
/// Locality assigned to tags carried over from an upgraded cluster.
pub const TAG_LOCALITY_UPGRADED: i8 = -4;

/// Identifier for a storage-server group that must receive a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub locality: i8,
    pub id: u16,
}

impl Tag {
    pub const fn new(locality: i8, id: u16) -> Self {
        Self { locality, id }
    }
}

/// Tag that no valid storage server carries.
pub const INVALID_TAG: Tag = Tag::new(TAG_LOCALITY_SPECIAL, 0);
/// Tag of the transaction-state (txs) stream in the replicated log.
pub const TXS_TAG: Tag = Tag::new(TAG_LOCALITY_SPECIAL, 1);
/// Tag added for mutations that fall inside a cached key range.
pub const CACHE_TAG: Tag = Tag::new(TAG_LOCALITY_SPECIAL, 2);

/// Admission priority of a read-version request.
///
/// The numeric values are part of the client wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Batch = 0,
    Default = 256,
    Immediate = 512,
}

/// Half-open key range `[begin, end)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub begin: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Range covering exactly one key.
    pub fn single_key(key: impl Into<Bytes>) -> Self {
        let begin: Bytes = key.into();
        let end = crate::keys::key_after(&begin);
        Self { begin, end }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    /// True if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Intersection of two ranges; empty ranges are returned as-is.
    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            begin: self.begin.clone().max(other.begin.clone()),
            end: self.end.clone().min(other.end.clone()),
        }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            crate::keys::printable(&self.begin),
            crate::keys::printable(&self.end)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_range_contains_only_that_key() {
        let r = KeyRange::single_key(&b"foo"[..]);
        assert!(r.contains(b"foo"));
        assert!(!r.contains(b"foo\x01"));
        assert!(!r.contains(b"fop"));
        assert!(!r.contains(b"fo"));
    }

    #[test]
    fn range_intersection_clips_both_ends() {
        let a = KeyRange::new(&b"b"[..], &b"f"[..]);
        let b = KeyRange::new(&b"d"[..], &b"z"[..]);
        assert!(a.intersects(&b));
        let i = a.intersection(&b);
        assert_eq!(i, KeyRange::new(&b"d"[..], &b"f"[..]));
        let c = KeyRange::new(&b"f"[..], &b"g"[..]);
        assert!(!a.intersects(&c));
    }

    #[test]
    fn priority_ordering_matches_wire_values() {
        assert!(Priority::Immediate > Priority::Default);
        assert!(Priority::Default > Priority::Batch);
        assert_eq!(Priority::Default as i32, 256);
    }
}
