//! In-memory transaction-state store.
//!
//! The commit proxy keeps a logical KV image of the shared cluster metadata,
//! seeded from replayed `TxnStateRequest`s and mutated only by metadata
//! mutations. Writes take effect immediately for reads; `commit` drains the
//! messages accumulated since the previous commit so they can ride the txs
//! stream of the replicated log, and hands back an acknowledgement handle
//! that phase 5 resolves once the corresponding log push is durable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sable_core::mutation::Mutation;
use sable_core::types::{KeyRange, Version};

#[derive(Debug, Default)]
pub struct TxnStateStore {
    data: BTreeMap<Bytes, Bytes>,
    pending_messages: Vec<Bytes>,
    outstanding_commits: Arc<AtomicUsize>,
}

/// The messages of one store commit plus the acknowledgement handle.
///
/// `pop_to` is the version up to which the txs stream is subsumed by this
/// state image once the commit is acknowledged.
#[derive(Debug)]
pub struct StoreCommit {
    pub messages: Vec<Bytes>,
    pub pop_to: Version,
    outstanding: Arc<AtomicUsize>,
    acked: bool,
}

impl StoreCommit {
    /// Acknowledge the commit; ordered after the batch's log push.
    pub fn acknowledge(mut self) {
        self.acked = true;
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Acknowledge and discard the messages (writes logged by another proxy).
    pub fn discard(self) {
        self.acknowledge();
    }
}

impl Drop for StoreCommit {
    fn drop(&mut self) {
        // Guarantee the outstanding counter decrements on every exit path.
        if !self.acked {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl TxnStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one key without generating a log message (snapshot replay).
    pub fn seed(&mut self, key: Bytes, value: Bytes) {
        self.data.insert(key, value);
    }

    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.pending_messages
            .push(Mutation::set(key.clone(), value.clone()).encode());
        self.data.insert(key, value);
    }

    pub fn clear_range(&mut self, range: &KeyRange) {
        self.pending_messages
            .push(Mutation::clear_range(range.begin.clone(), range.end.clone()).encode());
        let stale: Vec<Bytes> = self
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.data.remove(&key);
        }
    }

    pub fn read_value(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    /// Key/value pairs in `range`, ascending, up to `limit`.
    pub fn read_range(&self, range: &KeyRange, limit: usize) -> Vec<(Bytes, Bytes)> {
        self.data
            .range(range.begin.clone()..range.end.clone())
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drain accumulated messages into a commit handle.
    pub fn commit(&mut self, pop_to: Version) -> StoreCommit {
        self.outstanding_commits.fetch_add(1, Ordering::Relaxed);
        StoreCommit {
            messages: std::mem::take(&mut self.pending_messages),
            pop_to,
            outstanding: self.outstanding_commits.clone(),
            acked: false,
        }
    }

    /// Commits handed out but not yet acknowledged.
    pub fn outstanding_commits(&self) -> usize {
        self.outstanding_commits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_core::mutation::MutationKind;

    fn b(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    #[test]
    fn writes_are_visible_immediately_and_drained_on_commit() {
        let mut store = TxnStateStore::new();
        store.set(b(b"\xff/a"), b(b"1"));
        store.set(b(b"\xff/b"), b(b"2"));
        assert_eq!(store.read_value(b"\xff/a"), Some(b(b"1")));

        let commit = store.commit(7);
        assert_eq!(commit.messages.len(), 2);
        assert_eq!(commit.pop_to, 7);
        let first = Mutation::decode(&commit.messages[0]).unwrap();
        assert_eq!(first.kind, MutationKind::SetValue);
        assert_eq!(store.outstanding_commits(), 1);
        commit.acknowledge();
        assert_eq!(store.outstanding_commits(), 0);

        // A second commit only carries what happened since.
        store.clear_range(&KeyRange::new(b(b"\xff/a"), b(b"\xff/b")));
        let commit = store.commit(9);
        assert_eq!(commit.messages.len(), 1);
        assert_eq!(store.read_value(b"\xff/a"), None);
        assert_eq!(store.read_value(b"\xff/b"), Some(b(b"2")));
        commit.discard();
    }

    #[test]
    fn dropped_commit_still_releases_the_counter() {
        let mut store = TxnStateStore::new();
        store.set(b(b"\xff/a"), b(b"1"));
        {
            let _commit = store.commit(1);
            assert_eq!(store.outstanding_commits(), 1);
        }
        assert_eq!(store.outstanding_commits(), 0);
    }

    #[test]
    fn read_range_is_ordered_and_limited() {
        let mut store = TxnStateStore::new();
        for key in [&b"\xff/c"[..], b"\xff/a", b"\xff/b"] {
            store.seed(b(key), b(key));
        }
        let all = store.read_range(&KeyRange::new(b(b"\xff/"), b(b"\xff0")), 10);
        assert_eq!(all.len(), 3);
        assert!(all[0].0 < all[1].0 && all[1].0 < all[2].0);
        let limited = store.read_range(&KeyRange::new(b(b"\xff/"), b(b"\xff0")), 2);
        assert_eq!(limited.len(), 2);
    }
}
