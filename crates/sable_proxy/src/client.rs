//! Embedded transaction client.
//!
//! Buffers reads and writes, accumulates conflict ranges, and drives the two
//! proxy roles: a read version from the read-version proxy, a commit through
//! the commit proxy. Reads-your-writes is provided by folding the buffered
//! mutations over storage values. This is the surface the integration tests
//! and the workload driver exercise.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sable_core::atomic::apply_atomic_op;
use sable_core::keys;
use sable_core::messages::{
    CommitId, CommitTransaction, CommitTransactionRequest, GetReadVersionRequest,
    GetReadVersionReply, TagThrottleInfo, COMMIT_FLAG_FIRST_IN_BATCH, COMMIT_FLAG_LOCK_AWARE,
    GRV_FLAG_CAUSAL_READ_RISKY, GRV_FLAG_USE_MIN_KNOWN_COMMITTED_VERSION,
};
use sable_core::messages::CommitCostEstimation;
use sable_core::mutation::{versionstamp, write_operation_cost, Mutation, MutationKind};
use sable_core::types::{KeyRange, Priority, TransactionTag, Version, INVALID_VERSION};
use sable_core::StoreError;
use tokio::sync::{mpsc, oneshot};

use crate::config::TransactionLimits;
use crate::sim::{SimStorage, WatchSlot};

struct DatabaseInner {
    grv_tx: mpsc::UnboundedSender<GetReadVersionRequest>,
    commit_tx: mpsc::UnboundedSender<CommitTransactionRequest>,
    storage: Arc<SimStorage>,
    limits: TransactionLimits,
    watch_count: Arc<AtomicUsize>,
}

/// Handle to a cluster; cheap to clone, hands out transactions.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(
        grv_tx: mpsc::UnboundedSender<GetReadVersionRequest>,
        commit_tx: mpsc::UnboundedSender<CommitTransactionRequest>,
        storage: Arc<SimStorage>,
        limits: TransactionLimits,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                grv_tx,
                commit_tx,
                storage,
                limits,
                watch_count: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    pub fn live_watches(&self) -> usize {
        self.inner.watch_count.load(Ordering::Relaxed)
    }
}

/// Per-transaction options.
#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub lock_aware: bool,
    pub access_system_keys: bool,
    pub read_system_keys: bool,
    pub report_conflicting_keys: bool,
    pub timeout: Option<Duration>,
    pub size_limit: usize,
    pub priority: Priority,
    pub causal_read_risky: bool,
    pub use_min_known_committed_version: bool,
    pub first_in_batch: bool,
    pub watches_disabled: bool,
    pub tags: Vec<TransactionTag>,
}

impl TransactionOptions {
    fn new(limits: &TransactionLimits) -> Self {
        Self {
            lock_aware: false,
            access_system_keys: false,
            read_system_keys: false,
            report_conflicting_keys: false,
            timeout: None,
            size_limit: limits.size_limit,
            priority: Priority::Default,
            causal_read_risky: false,
            use_min_known_committed_version: false,
            first_in_batch: false,
            watches_disabled: false,
            tags: Vec::new(),
        }
    }
}

/// A pending watch; resolves when the key's value changes, or fails if the
/// owning transaction is cancelled or reset.
pub struct Watch {
    rx: oneshot::Receiver<Result<(), StoreError>>,
    _permit: WatchPermit,
}

impl Watch {
    pub async fn wait(self) -> Result<(), StoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::OperationCancelled),
        }
    }
}

struct WatchPermit {
    count: Arc<AtomicUsize>,
}

impl Drop for WatchPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One client transaction.
pub struct Transaction {
    db: Database,
    pub options: TransactionOptions,
    start: Instant,
    read_version: Option<Version>,
    grv_reply: Option<GetReadVersionReply>,
    mutations: Vec<Mutation>,
    read_conflict_ranges: Vec<KeyRange>,
    write_conflict_ranges: Vec<KeyRange>,
    committed: Option<CommitId>,
    conflicting_indices: Option<Vec<usize>>,
    cancelled: bool,
    watch_slots: Vec<WatchSlot>,
}

impl Transaction {
    fn new(db: Database) -> Self {
        let options = TransactionOptions::new(&db.inner.limits);
        Self {
            db,
            options,
            start: Instant::now(),
            read_version: None,
            grv_reply: None,
            mutations: Vec::new(),
            read_conflict_ranges: Vec::new(),
            write_conflict_ranges: Vec::new(),
            committed: None,
            conflicting_indices: None,
            cancelled: false,
            watch_slots: Vec::new(),
        }
    }

    /// Set the per-transaction size limit; bounds are part of the option
    /// contract.
    pub fn set_size_limit(&mut self, limit: usize) -> Result<(), StoreError> {
        if !(32..=10_000_000).contains(&limit) {
            return Err(StoreError::InvalidOptionValue);
        }
        self.options.size_limit = limit;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = Some(timeout);
    }

    fn check_state(&self) -> Result<(), StoreError> {
        if self.cancelled {
            return Err(StoreError::TransactionCancelled);
        }
        if let Some(timeout) = self.options.timeout {
            if self.start.elapsed() > timeout {
                return Err(StoreError::TransactionTimedOut);
            }
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        future: impl std::future::Future<Output = Result<Result<T, StoreError>, oneshot::error::RecvError>>,
    ) -> Result<T, StoreError> {
        let result = match self.options.timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(self.start.elapsed());
                tokio::time::timeout(remaining, future)
                    .await
                    .map_err(|_| StoreError::TransactionTimedOut)?
            }
            None => future.await,
        };
        result.map_err(|_| StoreError::OperationCancelled)?
    }

    fn validate_readable(&self, key: &[u8]) -> Result<(), StoreError> {
        if key.len() > self.db.inner.limits.key_size_limit {
            return Err(StoreError::KeyTooLarge);
        }
        if key >= keys::ALL_KEYS_END {
            return Err(StoreError::KeyOutsideLegalRange);
        }
        if key >= keys::NORMAL_KEYS_END
            && !(self.options.access_system_keys || self.options.read_system_keys)
        {
            return Err(StoreError::KeyOutsideLegalRange);
        }
        Ok(())
    }

    fn validate_writable(&self, key: &[u8]) -> Result<(), StoreError> {
        if key.len() > self.db.inner.limits.key_size_limit {
            return Err(StoreError::KeyTooLarge);
        }
        if key >= keys::ALL_KEYS_END
            || (key >= keys::NORMAL_KEYS_END && !self.options.access_system_keys)
        {
            return Err(StoreError::KeyOutsideLegalRange);
        }
        Ok(())
    }

    /// The causally consistent snapshot version of this transaction,
    /// fetching one on first use.
    pub async fn get_read_version(&mut self) -> Result<Version, StoreError> {
        if let Some(version) = self.read_version {
            return Ok(version);
        }
        self.check_state()?;
        let mut flags = 0u32;
        if self.options.causal_read_risky {
            flags |= GRV_FLAG_CAUSAL_READ_RISKY;
        }
        if self.options.use_min_known_committed_version {
            flags |= GRV_FLAG_USE_MIN_KNOWN_COMMITTED_VERSION;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = GetReadVersionRequest {
            priority: self.options.priority,
            flags,
            transaction_count: 1,
            tags: self.options.tags.iter().map(|t| (t.clone(), 1)).collect(),
            debug_id: None,
            span: tracing::Span::current(),
            reply: reply_tx,
        };
        self.db
            .inner
            .grv_tx
            .send(request)
            .map_err(|_| StoreError::OperationCancelled)?;
        let reply = self.with_timeout(reply_rx).await?;
        if reply.locked && !self.options.lock_aware {
            return Err(StoreError::DatabaseLocked);
        }
        self.read_version = Some(reply.version);
        self.grv_reply = Some(reply);
        Ok(self.read_version.unwrap_or(INVALID_VERSION))
    }

    /// Throttle advice attached to the read-version reply, if any.
    pub fn tag_throttles(&self) -> Option<&std::collections::HashMap<TransactionTag, TagThrottleInfo>> {
        self.grv_reply.as_ref().map(|r| &r.tag_throttle_info)
    }

    /// Fold buffered mutations over a base value for read-your-writes.
    fn overlay_value(&self, key: &[u8], base: Option<Bytes>) -> Option<Bytes> {
        let mut value = base;
        for mutation in &self.mutations {
            match mutation.kind {
                MutationKind::SetValue => {
                    if mutation.param1.as_ref() == key {
                        value = Some(mutation.param2.clone());
                    }
                }
                MutationKind::ClearRange => {
                    if mutation.param1.as_ref() <= key && key < mutation.param2.as_ref() {
                        value = None;
                    }
                }
                MutationKind::SetVersionstampedKey | MutationKind::SetVersionstampedValue => {
                    // The final key/value is unknown until commit.
                }
                _ => {
                    if mutation.param1.as_ref() == key {
                        value = apply_atomic_op(
                            mutation.kind,
                            value.as_deref(),
                            &mutation.param2,
                            self.db.inner.limits.value_size_limit,
                        )
                        .map(Bytes::from);
                    }
                }
            }
        }
        value
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.get_inner(key, false).await
    }

    /// Read without adding a conflict range.
    pub async fn get_snapshot(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.get_inner(key, true).await
    }

    async fn get_inner(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Bytes>, StoreError> {
        self.check_state()?;
        self.validate_readable(key)?;
        let version = self.get_read_version().await?;
        let base = self.db.inner.storage.get(key, version);
        let value = self.overlay_value(key, base);
        if !snapshot {
            self.read_conflict_ranges
                .push(KeyRange::single_key(Bytes::copy_from_slice(key)));
        }
        Ok(value)
    }

    /// Ordered range read with read-your-writes; returns the rows and a
    /// more flag when `limit` truncated the result.
    pub async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<(Vec<(Bytes, Bytes)>, bool), StoreError> {
        self.check_state()?;
        self.validate_readable(begin)?;
        if begin > end {
            return Err(StoreError::InvertedRange);
        }
        let version = self.get_read_version().await?;
        let range = KeyRange::new(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end));
        let (stored, _) = self
            .db
            .inner
            .storage
            .get_range(&range, usize::MAX, false, version);

        let mut candidates: BTreeSet<Bytes> = stored.iter().map(|(k, _)| k.clone()).collect();
        for mutation in &self.mutations {
            if mutation.is_single_key() && range.contains(&mutation.param1) {
                candidates.insert(mutation.param1.clone());
            }
        }
        let stored_map: std::collections::BTreeMap<Bytes, Bytes> = stored.into_iter().collect();

        let mut rows = Vec::new();
        let keys_in_order: Vec<Bytes> = if reverse {
            candidates.into_iter().rev().collect()
        } else {
            candidates.into_iter().collect()
        };
        for key in keys_in_order {
            if let Some(value) = self.overlay_value(&key, stored_map.get(&key).cloned()) {
                rows.push((key, value));
            }
        }
        let more = rows.len() > limit;
        rows.truncate(limit);

        self.read_conflict_ranges.push(range);
        Ok((rows, more))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_state()?;
        self.validate_writable(key)?;
        if value.len() > self.db.inner.limits.value_size_limit {
            return Err(StoreError::ValueTooLarge);
        }
        let key = Bytes::copy_from_slice(key);
        self.write_conflict_ranges
            .push(KeyRange::single_key(key.clone()));
        self.mutations
            .push(Mutation::set(key, Bytes::copy_from_slice(value)));
        Ok(())
    }

    pub fn clear(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let end = keys::key_after(key);
        self.clear_range(key, &end)
    }

    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<(), StoreError> {
        self.check_state()?;
        self.validate_writable(begin)?;
        if begin > end {
            return Err(StoreError::InvertedRange);
        }
        let begin = Bytes::copy_from_slice(begin);
        let end = Bytes::copy_from_slice(end);
        self.write_conflict_ranges
            .push(KeyRange::new(begin.clone(), end.clone()));
        self.mutations.push(Mutation::clear_range(begin, end));
        Ok(())
    }

    pub fn atomic_op(
        &mut self,
        kind: MutationKind,
        key: &[u8],
        operand: &[u8],
    ) -> Result<(), StoreError> {
        self.check_state()?;
        if matches!(kind, MutationKind::SetValue | MutationKind::ClearRange) {
            return Err(StoreError::ClientInvalidOperation);
        }
        self.validate_writable(
            if kind == MutationKind::SetVersionstampedKey && key.len() >= 14 {
                // Validate the prefix portion; the stamp lands inside it.
                &key[..key.len() - 14]
            } else {
                key
            },
        )?;
        if operand.len() > self.db.inner.limits.value_size_limit {
            return Err(StoreError::ValueTooLarge);
        }
        let key = Bytes::copy_from_slice(key);
        // The rewritten key's conflict range is added by the commit proxy
        // once the stamp is known.
        if kind != MutationKind::SetVersionstampedKey {
            self.write_conflict_ranges
                .push(KeyRange::single_key(key.clone()));
        }
        self.mutations
            .push(Mutation::atomic(kind, key, Bytes::copy_from_slice(operand)));
        Ok(())
    }

    pub fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) {
        self.read_conflict_ranges.push(KeyRange::new(
            Bytes::copy_from_slice(begin),
            Bytes::copy_from_slice(end),
        ));
    }

    pub fn add_write_conflict_range(&mut self, begin: &[u8], end: &[u8]) {
        self.write_conflict_ranges.push(KeyRange::new(
            Bytes::copy_from_slice(begin),
            Bytes::copy_from_slice(end),
        ));
    }

    /// Commit the buffered writes. Read-only transactions commit locally and
    /// report an invalid version.
    pub async fn commit(&mut self) -> Result<Version, StoreError> {
        self.check_state()?;
        if self.committed.is_some() {
            return Err(StoreError::UsedDuringCommit);
        }
        if self.mutations.is_empty() && self.write_conflict_ranges.is_empty() {
            self.committed = Some(CommitId {
                version: INVALID_VERSION,
                batch_index: 0,
                metadata_version: None,
                conflicting_range_indices: None,
            });
            return Ok(INVALID_VERSION);
        }

        let transaction_size: usize = self.mutations.iter().map(Mutation::expected_size).sum();
        if transaction_size > self.options.size_limit {
            return Err(StoreError::TransactionTooLarge);
        }

        let read_snapshot = self.get_read_version().await?;
        let mut flags = 0u8;
        if self.options.lock_aware {
            flags |= COMMIT_FLAG_LOCK_AWARE;
        }
        if self.options.first_in_batch {
            flags |= COMMIT_FLAG_FIRST_IN_BATCH;
        }

        // Cost estimate for the proxy's tag-cost sampler.
        let mut write_costs = 0u64;
        let mut clear_idx_costs = std::collections::VecDeque::new();
        for (index, mutation) in self.mutations.iter().enumerate() {
            let cost = write_operation_cost(mutation.expected_size());
            write_costs += cost;
            if mutation.kind == MutationKind::ClearRange {
                clear_idx_costs.push_back((index, cost));
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommitTransactionRequest {
            transaction: CommitTransaction {
                read_snapshot,
                mutations: self.mutations.clone(),
                read_conflict_ranges: self.read_conflict_ranges.clone(),
                write_conflict_ranges: self.write_conflict_ranges.clone(),
                report_conflicting_keys: self.options.report_conflicting_keys,
            },
            flags,
            tags: self.options.tags.clone(),
            commit_cost_estimation: Some(CommitCostEstimation {
                write_costs,
                clear_idx_costs,
                expensive_cost_est_count: 0,
            }),
            debug_id: None,
            span: tracing::Span::current(),
            reply: reply_tx,
        };
        self.db
            .inner
            .commit_tx
            .send(request)
            .map_err(|_| StoreError::OperationCancelled)?;

        let id = self.with_timeout(reply_rx).await?;
        if id.version == INVALID_VERSION {
            self.conflicting_indices = id.conflicting_range_indices;
            return Err(StoreError::NotCommitted);
        }
        let version = id.version;
        self.committed = Some(id);
        Ok(version)
    }

    /// Version this transaction committed at, if it has.
    pub fn committed_version(&self) -> Option<Version> {
        self.committed.as_ref().map(|id| id.version)
    }

    /// The 10-byte versionstamp of a successful commit.
    pub fn get_versionstamp(&self) -> Result<[u8; 10], StoreError> {
        match &self.committed {
            Some(id) if id.version != INVALID_VERSION => {
                Ok(versionstamp(id.version, id.batch_index))
            }
            _ => Err(StoreError::ClientInvalidOperation),
        }
    }

    /// Indices of the read-conflict ranges that lost, when conflict-key
    /// reporting was requested and the commit conflicted.
    pub fn conflicting_range_indices(&self) -> Option<&[usize]> {
        self.conflicting_indices.as_deref()
    }

    /// Watch a key for changes; resolves when its value departs from the
    /// value observed now.
    pub fn watch(&mut self, key: &[u8]) -> Result<Watch, StoreError> {
        self.check_state()?;
        if self.options.watches_disabled {
            return Err(StoreError::WatchesDisabled);
        }
        let count = &self.db.inner.watch_count;
        let max_watches = self.db.inner.limits.max_watches;
        if count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < max_watches).then_some(current + 1)
            })
            .is_err()
        {
            return Err(StoreError::TooManyWatches);
        }
        let expected = self.db.inner.storage.get(key, Version::MAX);
        let (slot, rx) = self
            .db
            .inner
            .storage
            .watch(Bytes::copy_from_slice(key), expected);
        self.watch_slots.push(slot);
        Ok(Watch {
            rx,
            _permit: WatchPermit {
                count: count.clone(),
            },
        })
    }

    fn fail_pending_watches(&mut self, error: StoreError) {
        for slot in self.watch_slots.drain(..) {
            if let Some(sender) = slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
            {
                let _ = sender.send(Err(error));
            }
        }
    }

    /// Cancel the transaction; pending watches fail.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.fail_pending_watches(StoreError::TransactionCancelled);
    }

    /// Reset to a fresh transaction, keeping the options.
    pub fn reset(&mut self) {
        self.fail_pending_watches(StoreError::TransactionCancelled);
        self.start = Instant::now();
        self.read_version = None;
        self.grv_reply = None;
        self.mutations.clear();
        self.read_conflict_ranges.clear();
        self.write_conflict_ranges.clear();
        self.committed = None;
        self.conflicting_indices = None;
        self.cancelled = false;
    }

    /// Standard retry hook: reset and continue on retryable errors.
    pub async fn on_error(&mut self, error: StoreError) -> Result<(), StoreError> {
        if error.is_retryable() {
            if error.is_maybe_committed() {
                tracing::debug!("retrying a maybe-committed transaction");
            }
            self.reset();
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        } else {
            Err(error)
        }
    }
}
