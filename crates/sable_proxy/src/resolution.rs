//! Builds the per-resolver conflict-detection requests for one commit batch.
//!
//! Each transaction is projected onto the resolvers that own any of its
//! conflict ranges, versionstamp placeholders are filled in with the batch's
//! commit version, and metadata-bearing transactions are mirrored into
//! resolver 0 so every proxy can learn their side effects. The builder also
//! records, per transaction, which resolvers saw it and how its read-conflict
//! ranges were renumbered, so conflict reports can be mapped back to
//! client-visible indices.

use std::collections::BTreeSet;

use sable_core::keys;
use sable_core::messages::{
    CommitTransaction, CommitTransactionRequest, ResolveTransactionBatchRequest,
};
use sable_core::mutation::{transform_versionstamp, MutationKind};
use sable_core::types::{KeyRange, Version};
use sable_core::StoreError;

use crate::commit_data::CommitState;

/// Check every versionstamp placeholder of a transaction before the batch is
/// projected, so an invalid offset fails only that transaction.
pub fn validate_versionstamps(tr: &CommitTransaction) -> Result<(), StoreError> {
    use sable_core::mutation::VERSIONSTAMP_SIZE;
    for mutation in &tr.mutations {
        let param = match mutation.kind {
            MutationKind::SetVersionstampedKey => &mutation.param1,
            MutationKind::SetVersionstampedValue => &mutation.param2,
            _ => continue,
        };
        if param.len() < 4 {
            return Err(StoreError::ClientInvalidOperation);
        }
        let mut offset_buf = [0u8; 4];
        offset_buf.copy_from_slice(&param[param.len() - 4..]);
        let offset = u32::from_le_bytes(offset_buf) as usize;
        if offset + VERSIONSTAMP_SIZE > param.len() - 4 {
            return Err(StoreError::ClientInvalidOperation);
        }
    }
    Ok(())
}

pub struct ResolutionRequestBuilder {
    pub requests: Vec<ResolveTransactionBatchRequest>,
    /// Per batch transaction, the resolvers it was sent to.
    pub transaction_resolver_map: Vec<Vec<usize>>,
    /// `[transaction][resolver][range index on resolver]` → original index.
    pub tx_read_conflict_range_index_map: Vec<Vec<Vec<usize>>>,
    /// Per resolver, the index of the current transaction's projection.
    out_tr: Vec<Option<usize>>,
}

impl ResolutionRequestBuilder {
    pub fn new(
        resolver_count: usize,
        version: Version,
        prev_version: Version,
        last_received_version: Version,
    ) -> Self {
        let requests = (0..resolver_count)
            .map(|_| ResolveTransactionBatchRequest {
                prev_version,
                version,
                last_received_version,
                transactions: Vec::new(),
                txn_state_transactions: Vec::new(),
                debug_id: None,
            })
            .collect();
        Self {
            requests,
            transaction_resolver_map: Vec::new(),
            tx_read_conflict_range_index_map: Vec::new(),
            out_tr: vec![None; resolver_count],
        }
    }

    /// Index of this transaction's projection on `resolver`, creating an
    /// empty projection on first use.
    fn out_index(&mut self, resolver: usize, read_snapshot: Version) -> usize {
        match self.out_tr[resolver] {
            Some(index) => index,
            None => {
                let request = &mut self.requests[resolver];
                request.transactions.push(CommitTransaction {
                    read_snapshot,
                    ..CommitTransaction::default()
                });
                let index = request.transactions.len() - 1;
                self.out_tr[resolver] = Some(index);
                index
            }
        }
    }

    fn out_transaction(&mut self, resolver: usize, read_snapshot: Version) -> &mut CommitTransaction {
        let index = self.out_index(resolver, read_snapshot);
        &mut self.requests[resolver].transactions[index]
    }

    /// Record a transaction that is excluded from resolution (structural
    /// error), keeping the per-transaction maps index-aligned.
    pub fn add_skipped(&mut self) {
        self.tx_read_conflict_range_index_map
            .push(vec![Vec::new(); self.requests.len()]);
        self.transaction_resolver_map.push(Vec::new());
    }

    /// Project one transaction onto the resolvers.
    ///
    /// Mutates the request in place (versionstamp fill-in and the lock-defeat
    /// read-conflict range survive to the dispatch passes). A structural
    /// error from versionstamp validation fails only this transaction.
    pub fn add_transaction(
        &mut self,
        state: &CommitState,
        request: &mut CommitTransactionRequest,
        batch_index: u16,
    ) -> Result<(), StoreError> {
        self.out_tr.iter_mut().for_each(|slot| *slot = None);
        let version = self.requests[0].version;

        let tr = &mut request.transaction;
        let mut is_txn_state_transaction = false;
        for i in 0..tr.mutations.len() {
            match tr.mutations[i].kind {
                MutationKind::SetVersionstampedKey => {
                    let rewritten = transform_versionstamp(&tr.mutations[i].param1, version, batch_index)?;
                    tr.mutations[i].kind = MutationKind::SetValue;
                    tr.mutations[i].param1 = rewritten;
                    tr.write_conflict_ranges
                        .push(KeyRange::single_key(tr.mutations[i].param1.clone()));
                }
                MutationKind::SetVersionstampedValue => {
                    let rewritten = transform_versionstamp(&tr.mutations[i].param2, version, batch_index)?;
                    tr.mutations[i].kind = MutationKind::SetValue;
                    tr.mutations[i].param2 = rewritten;
                }
                _ => {}
            }
            if tr.mutations[i].is_metadata_mutation() {
                is_txn_state_transaction = true;
                let mutation = tr.mutations[i].clone();
                let read_snapshot = tr.read_snapshot;
                self.out_transaction(0, read_snapshot).mutations.push(mutation);
            }
        }

        if is_txn_state_transaction && !request.is_lock_aware() {
            // This transaction held a read version, so the lock key was clear
            // at its snapshot; adding it as a read-conflict range makes a
            // concurrent lock defeat the commit.
            request
                .transaction
                .read_conflict_ranges
                .push(keys::database_locked_range());
        }

        let tr = &request.transaction;
        // [resolver][range index on resolver] → original client index.
        let mut rcr_index_map: Vec<Vec<usize>> = vec![Vec::new(); self.requests.len()];
        for (idx, range) in tr.read_conflict_ranges.iter().enumerate() {
            let mut resolvers = BTreeSet::new();
            for (_, history) in state.key_resolvers.intersecting(range) {
                // Newest to oldest: include everything effective at or after
                // the snapshot, plus the first earlier entry.
                for (effective_from, resolver) in history.iter().rev() {
                    resolvers.insert(*resolver);
                    if *effective_from < tr.read_snapshot {
                        break;
                    }
                }
            }
            debug_assert!(!resolvers.is_empty(), "read range mapped to no resolver");
            for resolver in resolvers {
                self.out_transaction(resolver, tr.read_snapshot)
                    .read_conflict_ranges
                    .push(range.clone());
                rcr_index_map[resolver].push(idx);
            }
        }
        self.tx_read_conflict_range_index_map.push(rcr_index_map);

        let tr = &request.transaction;
        for range in &tr.write_conflict_ranges {
            let mut resolvers = BTreeSet::new();
            for (_, history) in state.key_resolvers.intersecting(range) {
                if let Some((_, resolver)) = history.back() {
                    resolvers.insert(*resolver);
                }
            }
            debug_assert!(!resolvers.is_empty(), "write range mapped to no resolver");
            for resolver in resolvers {
                self.out_transaction(resolver, tr.read_snapshot)
                    .write_conflict_ranges
                    .push(range.clone());
            }
        }

        if is_txn_state_transaction {
            // Every resolver tracks the same count of txn-state transactions,
            // materializing an (possibly empty) projection where needed.
            let read_snapshot = request.transaction.read_snapshot;
            for resolver in 0..self.requests.len() {
                let index = self.out_index(resolver, read_snapshot);
                self.requests[resolver].txn_state_transactions.push(index);
            }
        }

        let report_conflicting_keys = request.transaction.report_conflicting_keys;
        let mut resolvers_used = Vec::new();
        for resolver in 0..self.out_tr.len() {
            if let Some(index) = self.out_tr[resolver] {
                resolvers_used.push(resolver);
                self.requests[resolver].transactions[index].report_conflicting_keys =
                    report_conflicting_keys;
            }
        }
        self.transaction_resolver_map.push(resolvers_used);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitProxyConfig;
    use bytes::Bytes;
    use sable_core::mutation::Mutation;
    use tokio::sync::oneshot;

    fn state_with_resolver_split() -> CommitState {
        // Resolver 0 owns [..m), resolver 1 owns [m..) from version 100.
        let mut state = CommitState::new(&CommitProxyConfig::default());
        let upper = KeyRange::new(&b"m"[..], keys::ALL_KEYS_END);
        for history in state.key_resolvers.modify(&upper) {
            history.push_back((100, 1));
        }
        state
    }

    fn commit_request(tr: CommitTransaction, flags: u8) -> CommitTransactionRequest {
        let (reply, _rx) = oneshot::channel();
        CommitTransactionRequest {
            transaction: tr,
            flags,
            tags: Vec::new(),
            commit_cost_estimation: None,
            debug_id: None,
            span: tracing::Span::none(),
            reply,
        }
    }

    #[test]
    fn read_ranges_fan_out_by_snapshot_rule() {
        let state = state_with_resolver_split();
        let mut builder = ResolutionRequestBuilder::new(2, 1000, 900, 900);

        // Snapshot before the split: the old owner must also be consulted.
        let mut old_snapshot = commit_request(
            CommitTransaction {
                read_snapshot: 50,
                read_conflict_ranges: vec![KeyRange::single_key(&b"zebra"[..])],
                write_conflict_ranges: vec![KeyRange::single_key(&b"zebra"[..])],
                ..CommitTransaction::default()
            },
            0,
        );
        builder.add_transaction(&state, &mut old_snapshot, 0).unwrap();
        assert_eq!(builder.transaction_resolver_map[0], vec![0, 1]);
        // Write ranges go only to the newest owner.
        assert_eq!(builder.requests[1].transactions[0].write_conflict_ranges.len(), 1);
        assert!(builder.requests[0].transactions[0].write_conflict_ranges.is_empty());

        // Snapshot after the split: only the new owner sees the read.
        let mut new_snapshot = commit_request(
            CommitTransaction {
                read_snapshot: 500,
                read_conflict_ranges: vec![KeyRange::single_key(&b"zebra"[..])],
                ..CommitTransaction::default()
            },
            0,
        );
        builder.add_transaction(&state, &mut new_snapshot, 1).unwrap();
        assert_eq!(builder.transaction_resolver_map[1], vec![1]);
    }

    #[test]
    fn txn_state_transactions_are_padded_across_resolvers() {
        let state = state_with_resolver_split();
        let mut builder = ResolutionRequestBuilder::new(2, 1000, 900, 900);
        let mut req = commit_request(
            CommitTransaction {
                read_snapshot: 500,
                mutations: vec![Mutation::set(&b"\xff/conf/x"[..], &b"1"[..])],
                read_conflict_ranges: vec![KeyRange::single_key(&b"zzz"[..])],
                write_conflict_ranges: vec![KeyRange::single_key(&b"\xff/conf/x"[..])],
                ..CommitTransaction::default()
            },
            0,
        );
        builder.add_transaction(&state, &mut req, 0).unwrap();
        assert_eq!(
            builder.requests[0].txn_state_transactions.len(),
            builder.requests[1].txn_state_transactions.len()
        );
        // The non-lock-aware metadata write picked up the lock-defeat range.
        assert!(req
            .transaction
            .read_conflict_ranges
            .iter()
            .any(|r| r.contains(keys::DATABASE_LOCKED_KEY)));
        // Resolver 0 got the mirrored metadata mutation.
        assert_eq!(builder.requests[0].transactions[0].mutations.len(), 1);
    }

    #[test]
    fn versionstamped_key_rewrite_adds_write_range() {
        let state = state_with_resolver_split();
        let mut builder = ResolutionRequestBuilder::new(2, 0x1234, 900, 900);
        let mut key = b"user/".to_vec();
        key.extend_from_slice(&[0u8; 10]);
        key.extend_from_slice(&5u32.to_le_bytes());
        let mut req = commit_request(
            CommitTransaction {
                read_snapshot: 500,
                mutations: vec![Mutation {
                    kind: MutationKind::SetVersionstampedKey,
                    param1: Bytes::from(key),
                    param2: Bytes::from_static(b"v"),
                }],
                read_conflict_ranges: vec![KeyRange::single_key(&b"a"[..])],
                ..CommitTransaction::default()
            },
            0,
        );
        builder.add_transaction(&state, &mut req, 7).unwrap();
        let m = &req.transaction.mutations[0];
        assert_eq!(m.kind, MutationKind::SetValue);
        assert_eq!(&m.param1[..5], b"user/");
        assert_eq!(&m.param1[5..13], &0x1234i64.to_be_bytes());
        assert_eq!(&m.param1[13..15], &7u16.to_be_bytes());
        // The singleton write range of the final key was appended.
        assert_eq!(req.transaction.write_conflict_ranges.len(), 1);
        assert!(req.transaction.write_conflict_ranges[0].contains(&m.param1));
    }
}
