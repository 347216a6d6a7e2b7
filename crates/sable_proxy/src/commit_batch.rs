//! The five-phase commit pipeline.
//!
//! Each batch runs pre-resolution, resolution, post-resolution, logging, and
//! reply in order. Batches are serialized by batch number at two barriers:
//! a batch may not fetch its commit version until its predecessor has passed
//! resolution, and may not process resolver output until its predecessor's
//! log push was issued. Everything observable mutates only between
//! suspension points; the map-shaped state is locked per non-suspending
//! region and never across an `await`.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use sable_core::keys;
use sable_core::messages::{
    CommitId, CommitStatus, CommitTransactionRequest, GetCommitVersionRequest, LogPushBuffer,
    LogPushRequest, ReportRawCommittedVersionRequest, ResolveTransactionBatchReply,
};
use sable_core::mutation::{write_operation_cost, Mutation};
use sable_core::types::{KeyRange, Version, CACHE_TAG, INVALID_VERSION};
use sable_core::StoreError;
use tokio::task::JoinHandle;

use crate::batcher::BatchedRequests;
use crate::commit_data::{CommitProxyData, CommitState, MemoryReservation};
use crate::config::TransactionLimits;
use crate::resolution::{validate_versionstamps, ResolutionRequestBuilder};
use crate::txn_state::StoreCommit;

/// State carried across the five phases of one batch.
pub struct CommitBatchContext {
    data: Arc<CommitProxyData>,
    trs: Vec<CommitTransactionRequest>,
    /// Released on drop, covering every exit path.
    _reservations: Vec<MemoryReservation>,
    start_time: Instant,
    local_batch_number: i64,
    to_commit: LogPushBuffer,
    batch_operations: usize,
    batch_bytes: usize,
    latency_bucket: usize,
    commit_version: Version,
    prev_version: Version,
    max_transaction_bytes: usize,
    transaction_resolver_map: Vec<Vec<usize>>,
    tx_read_conflict_range_index_map: Vec<Vec<Vec<usize>>>,
    release_delay: Duration,
    release_handle: Option<JoinHandle<()>>,
    resolution: Vec<ResolveTransactionBatchReply>,
    is_my_first_batch: bool,
    old_coordinators: Option<Bytes>,
    store_commits: Vec<StoreCommit>,
    committed: Vec<CommitStatus>,
    /// Structural per-transaction failures detected while building requests.
    skipped: Vec<Option<StoreError>>,
    locked: bool,
    locked_after: bool,
    metadata_version_after: Option<Bytes>,
    commit_count: usize,
    mutation_count: u64,
    mutation_bytes: u64,
    /// Backup destination prefix → committed mutations to serialize.
    log_range_mutations: BTreeMap<Bytes, Vec<Mutation>>,
    pop_to: Version,
    logging_handle: Option<JoinHandle<anyhow::Result<Version>>>,
    commit_start_time: Instant,
    compute_start: Instant,
    compute_duration: Duration,
}

/// Commit one batch end to end.
pub async fn commit_batch(
    data: Arc<CommitProxyData>,
    batch: BatchedRequests,
) -> Result<(), StoreError> {
    let mut context = CommitBatchContext::new(data, batch);
    context.preresolution().await?;
    context.get_resolution().await?;
    context.post_resolution().await?;
    context.transaction_logging().await?;
    context.reply().await?;
    Ok(())
}

impl CommitBatchContext {
    fn new(data: Arc<CommitProxyData>, batch: BatchedRequests) -> Self {
        let local_batch_number = data
            .local_commit_batches_started
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let trs = batch.requests;
        let batch_operations: usize = trs.iter().map(|t| t.transaction.mutations.len()).sum();
        let batch_bytes: usize = trs.iter().map(|t| t.transaction.expected_size()).sum();
        let limits = TransactionLimits::default();
        let buckets = data.config.proxy_compute_buckets;
        let latency_bucket = if batch_operations == 0 {
            0
        } else {
            ((buckets * batch_bytes)
                / (batch_operations * (limits.value_size_limit + limits.key_size_limit)))
                .min(buckets - 1)
        };
        let tr_count = trs.len();
        data.stats.commit_batch_in.fetch_add(1, Ordering::Relaxed);
        Self {
            data,
            trs,
            _reservations: batch.reservations,
            start_time: Instant::now(),
            local_batch_number,
            to_commit: LogPushBuffer::new(),
            batch_operations,
            batch_bytes,
            latency_bucket,
            commit_version: INVALID_VERSION,
            prev_version: INVALID_VERSION,
            max_transaction_bytes: 0,
            transaction_resolver_map: Vec::new(),
            tx_read_conflict_range_index_map: Vec::new(),
            release_delay: Duration::ZERO,
            release_handle: None,
            resolution: Vec::new(),
            is_my_first_batch: false,
            old_coordinators: None,
            store_commits: Vec::new(),
            committed: vec![CommitStatus::Conflict; tr_count],
            skipped: (0..tr_count).map(|_| None).collect(),
            locked: false,
            locked_after: false,
            metadata_version_after: None,
            commit_count: 0,
            mutation_count: 0,
            mutation_bytes: 0,
            log_range_mutations: BTreeMap::new(),
            pop_to: 0,
            logging_handle: None,
            commit_start_time: Instant::now(),
            compute_start: Instant::now(),
            compute_duration: Duration::ZERO,
        }
    }

    /// Phase 1: ordered entry, commit-version fetch, resolver-map updates.
    async fn preresolution(&mut self) -> Result<(), StoreError> {
        let data = self.data.clone();
        data.latest_local_commit_batch_resolving
            .when_at_least(self.local_batch_number - 1)
            .await;

        let compute_per_operation =
            data.state().commit_compute_per_operation[self.latency_bucket];
        self.release_delay = Duration::from_secs_f64(
            (self.batch_operations as f64 * compute_per_operation)
                .min(data.config.max_proxy_compute.as_secs_f64()),
        );

        let request = GetCommitVersionRequest {
            request_num: data
                .commit_version_request_number
                .fetch_add(1, Ordering::SeqCst),
            most_recent_processed_request_num: data
                .most_recent_processed_request_number
                .load(Ordering::SeqCst),
            requesting_proxy: data.dbgid,
        };
        let reply = data
            .master
            .get_commit_version(request)
            .await
            .map_err(|_| StoreError::MasterTlogFailed)?;
        data.most_recent_processed_request_number
            .store(reply.request_num, Ordering::SeqCst);

        data.stats
            .txn_commit_version_assigned
            .fetch_add(self.trs.len() as u64, Ordering::Relaxed);
        data.stats
            .last_commit_version_assigned
            .store(reply.version, Ordering::Relaxed);

        self.commit_version = reply.version;
        self.prev_version = reply.prev_version;

        if !reply.resolver_changes.is_empty() {
            let mut state = data.state();
            for change in &reply.resolver_changes {
                for history in state.key_resolvers.modify(&change.range) {
                    history.push_back((reply.resolver_changes_version, change.dest));
                }
            }
        }
        Ok(())
    }

    /// Phase 2: project the batch onto the resolvers and collect verdicts.
    async fn get_resolution(&mut self) -> Result<(), StoreError> {
        let data = self.data.clone();
        let requests = {
            let state = data.state();
            let mut builder = ResolutionRequestBuilder::new(
                data.resolvers.len(),
                self.commit_version,
                self.prev_version,
                state.version,
            );
            let mut conflict_range_count = 0u64;
            for (index, tr) in self.trs.iter_mut().enumerate() {
                if let Err(err) = validate_versionstamps(&tr.transaction) {
                    self.skipped[index] = Some(err);
                    builder.add_skipped();
                    continue;
                }
                if let Err(err) = builder.add_transaction(&state, tr, index as u16) {
                    self.skipped[index] = Some(err);
                    builder.add_skipped();
                    continue;
                }
                conflict_range_count += (tr.transaction.read_conflict_ranges.len()
                    + tr.transaction.write_conflict_ranges.len())
                    as u64;
                self.max_transaction_bytes = self
                    .max_transaction_bytes
                    .max(tr.transaction.expected_size());
            }
            data.stats
                .conflict_ranges
                .fetch_add(conflict_range_count, Ordering::Relaxed);
            for r in 1..builder.requests.len() {
                assert_eq!(
                    builder.requests[r].txn_state_transactions.len(),
                    builder.requests[0].txn_state_transactions.len(),
                    "txn-state transaction count must agree across resolvers"
                );
            }
            self.transaction_resolver_map = std::mem::take(&mut builder.transaction_resolver_map);
            self.tx_read_conflict_range_index_map =
                std::mem::take(&mut builder.tx_read_conflict_range_index_map);
            builder.requests
        };

        data.stats
            .txn_commit_resolving
            .fetch_add(self.trs.len() as u64, Ordering::Relaxed);

        let replies = futures_util::future::try_join_all(
            data.resolvers
                .iter()
                .cloned()
                .zip(requests)
                .map(|(resolver, request)| async move { resolver.resolve(request).await }),
        );

        // The resolving barrier advances after the computed compute-cost
        // delay, releasing the next batch's phase 1 while we wait on the
        // network.
        let release = {
            let data = data.clone();
            let delay = self.release_delay;
            let batch_number = self.local_batch_number;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                debug_assert_eq!(
                    data.latest_local_commit_batch_resolving.get(),
                    batch_number - 1
                );
                data.latest_local_commit_batch_resolving.set(batch_number);
            })
        };
        self.release_handle = Some(release);

        self.resolution = replies.await.map_err(|_| StoreError::MasterTlogFailed)?;
        Ok(())
    }

    /// Phase 3: apply metadata, determine the committed set, dispatch
    /// mutations to tags, serialize backups, respect the MVCC window, and
    /// issue the log push.
    async fn post_resolution(&mut self) -> Result<(), StoreError> {
        let data = self.data.clone();
        data.latest_local_commit_batch_logging
            .when_at_least(self.local_batch_number - 1)
            .await;
        tokio::task::yield_now().await;
        self.compute_start = Instant::now();

        data.stats
            .txn_commit_resolved
            .fetch_add(self.trs.len() as u64, Ordering::Relaxed);

        let new_coordinators = {
            let mut state = data.state();
            self.is_my_first_batch = state.version == 0;
            self.old_coordinators = state.txn_state_store.read_value(keys::COORDINATORS_KEY);

            assert_resolution_state_mutations_size_consistent(&self.resolution);
            self.apply_metadata_effect(&mut state);
            self.determine_committed_transactions(&mut state);
            self.apply_metadata_to_committed_transactions(&mut state);
            state.version = self.commit_version;
            state.txn_state_store.read_value(keys::COORDINATORS_KEY)
        };
        data.valid_state.set();
        assert!(self.commit_version > 0);

        if !self.is_my_first_batch && new_coordinators != self.old_coordinators {
            // A coordinator change restarts the whole transaction subsystem;
            // the master call is expected to fail rather than reply.
            return match data
                .master
                .change_coordinators(new_coordinators.unwrap_or_default())
                .await
            {
                Ok(()) => Err(StoreError::CoordinatorsChanged),
                Err(err) => Err(err
                    .downcast::<StoreError>()
                    .unwrap_or(StoreError::CoordinatorsChanged)),
            };
        }

        self.assign_mutations_to_storage_servers().await;
        self.add_backup_mutations().await;

        data.stats
            .mutations
            .fetch_add(self.mutation_count, Ordering::Relaxed);
        data.stats
            .mutation_bytes
            .fetch_add(self.mutation_bytes, Ordering::Relaxed);

        // MVCC window: storage servers must not make versions durable that
        // could still need rolling back, so the pipeline stalls while the
        // durable frontier is too far behind.
        let window_floor =
            self.commit_version - data.config.max_read_transaction_life_versions;
        if data.committed_version.get() < window_floor {
            self.compute_duration += self.compute_start.elapsed();
            while data.committed_version.get() < window_floor {
                tokio::select! {
                    _ = data.committed_version.when_at_least(window_floor) => {
                        tokio::task::yield_now().await;
                        break;
                    }
                    reply = data.master.get_live_committed_version() => {
                        let reply = reply.map_err(|_| StoreError::MasterTlogFailed)?;
                        if reply.version > data.committed_version.get() {
                            let mut state = data.state();
                            state.locked = reply.locked;
                            state.metadata_version = reply.metadata_version.clone();
                            drop(state);
                            data.committed_version.set(reply.version);
                        }
                        if data.committed_version.get() < window_floor {
                            tokio::time::sleep(data.config.proxy_spin_delay).await;
                        }
                    }
                }
            }
            self.compute_start = Instant::now();
        }

        // The txn-state messages of this batch ride the txs stream.
        if let Some(commit) = self.store_commits.last() {
            self.pop_to = commit.pop_to;
            for message in commit.messages.clone() {
                self.to_commit.add_txs_message(message);
            }
        }

        self.commit_start_time = Instant::now();
        let push = LogPushRequest {
            prev_version: self.prev_version,
            version: self.commit_version,
            known_committed_version: data.committed_version.get(),
            min_known_committed_version: data
                .min_known_committed_version
                .load(Ordering::Relaxed),
            messages: std::mem::take(&mut self.to_commit).into_messages(),
        };
        let log_system = data.log_system.clone();
        self.logging_handle =
            Some(tokio::spawn(async move { log_system.push(push).await }));

        debug_assert_eq!(
            data.latest_local_commit_batch_logging.get(),
            self.local_batch_number - 1
        );
        data.latest_local_commit_batch_logging
            .set(self.local_batch_number);

        self.compute_duration += self.compute_start.elapsed();
        if self.compute_duration > data.config.min_proxy_compute && self.batch_operations > 0 {
            let per_operation = self.compute_duration.as_secs_f64() / self.batch_operations as f64;
            let mut state = data.state();
            let current = state.commit_compute_per_operation[self.latency_bucket];
            state.commit_compute_per_operation[self.latency_bucket] = if per_operation <= current {
                per_operation
            } else {
                data.config.proxy_compute_growth_rate * per_operation
                    + (1.0 - data.config.proxy_compute_growth_rate) * current
            };
        }
        Ok(())
    }

    /// Phase 4: wait out the log push and maintain txs pop bookkeeping.
    async fn transaction_logging(&mut self) -> Result<(), StoreError> {
        let data = self.data.clone();
        let Some(handle) = self.logging_handle.take() else {
            return Err(StoreError::MasterTlogFailed);
        };

        tokio::select! {
            result = handle => {
                let logged = result
                    .map_err(|_| StoreError::MasterTlogFailed)?
                    .map_err(|_| StoreError::MasterTlogFailed)?;
                data.update_min_known_committed_version(logged);
            }
            _ = data.committed_version.when_at_least(self.commit_version + 1) => {}
        }

        data.stats.last_commit_latency_us.store(
            self.commit_start_time.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
        tokio::task::yield_now().await;

        {
            let mut state = data.state();
            let frontier = state
                .txs_pop_versions
                .back()
                .map(|(_, pop)| *pop)
                .unwrap_or(state.last_txs_pop);
            if state.pop_remote_txs && self.pop_to > frontier {
                if state.txs_pop_versions.len() >= data.config.max_txs_pop_version_history {
                    tracing::warn!("discarding txs pop history");
                    state.txs_pop_versions.pop_front();
                }
                state
                    .txs_pop_versions
                    .push_back((self.commit_version, self.pop_to));
            }
        }
        data.log_system.pop_txs(self.pop_to, None);
        Ok(())
    }

    /// Phase 5: acknowledge store commits, report committed, reply, trim.
    async fn reply(&mut self) -> Result<(), StoreError> {
        let data = self.data.clone();

        for commit in self.store_commits.drain(..) {
            commit.acknowledge();
        }

        // Report to the master before updating the local view, preserving
        // master ≥ proxy for committed versions.
        if self.commit_version >= data.committed_version.get() {
            data.master
                .report_live_committed_version(ReportRawCommittedVersionRequest {
                    version: self.commit_version,
                    locked: self.locked_after,
                    metadata_version: self.metadata_version_after.clone(),
                    min_known_committed_version: data
                        .min_known_committed_version
                        .load(Ordering::Relaxed),
                })
                .await
                .map_err(|_| StoreError::MasterTlogFailed)?;
        }
        if self.commit_version > data.committed_version.get() {
            let mut state = data.state();
            state.locked = self.locked_after;
            state.metadata_version = self.metadata_version_after.clone();
            drop(state);
            data.committed_version.set(self.commit_version);
        }

        let mut next_tr = vec![0usize; self.resolution.len()];
        let trs = std::mem::take(&mut self.trs);
        for (index, tr) in trs.into_iter().enumerate() {
            let outcome = if let Some(err) = self.skipped[index] {
                Err(err)
            } else if self.committed[index] == CommitStatus::Committed
                && (!self.locked || tr.is_lock_aware())
            {
                Ok(CommitId {
                    version: self.commit_version,
                    batch_index: index as u16,
                    metadata_version: self.metadata_version_after.clone(),
                    conflicting_range_indices: None,
                })
            } else if self.committed[index] == CommitStatus::TooOld {
                Err(StoreError::TransactionTooOld)
            } else if tr.transaction.report_conflicting_keys {
                let empty = Vec::new();
                let mut indices = Vec::new();
                for &resolver in &self.transaction_resolver_map[index] {
                    let on_resolver = self.resolution[resolver]
                        .conflicting_key_range_map
                        .get(next_tr[resolver])
                        .unwrap_or(&empty);
                    for &range_index in on_resolver {
                        indices.push(
                            self.tx_read_conflict_range_index_map[index][resolver][range_index],
                        );
                    }
                }
                Ok(CommitId {
                    version: INVALID_VERSION,
                    batch_index: index as u16,
                    metadata_version: None,
                    conflicting_range_indices: Some(indices),
                })
            } else {
                Err(StoreError::NotCommitted)
            };
            for &resolver in &self.transaction_resolver_map[index] {
                next_tr[resolver] += 1;
            }
            let _ = tr.reply.send(outcome);
        }

        tracing::debug!(
            batch = self.local_batch_number,
            version = self.commit_version,
            transactions = self.committed.len(),
            committed = self.commit_count,
            operations = self.batch_operations,
            bytes = self.batch_bytes,
            max_transaction_bytes = self.max_transaction_bytes,
            "commit batch replied"
        );
        data.stats.commit_batch_out.fetch_add(1, Ordering::Relaxed);
        data.stats
            .txn_commit_out
            .fetch_add(self.committed.len() as u64, Ordering::Relaxed);
        data.stats.txn_commit_out_success.fetch_add(
            self.commit_count as u64,
            Ordering::Relaxed,
        );
        data.stats.txn_conflicts.fetch_add(
            (self.committed.len() - self.commit_count) as u64,
            Ordering::Relaxed,
        );

        {
            let mut state = data.state();
            if state.last_coalesce_time.elapsed() > data.config.resolver_coalesce_time {
                state.last_coalesce_time = Instant::now();
                let previous_size = state.key_resolvers.len();
                let oldest =
                    self.prev_version - data.config.max_write_transaction_life_versions;
                for history in state.key_resolvers.modify(&keys::all_keys()) {
                    while history.len() > 1
                        && history.get(1).map(|(from, _)| *from < oldest).unwrap_or(false)
                    {
                        history.pop_front();
                    }
                    if let Some(front) = history.front_mut() {
                        if front.0 < oldest {
                            front.0 = 0;
                        }
                    }
                }
                state.key_resolvers.coalesce();
                if state.key_resolvers.len() != previous_size {
                    tracing::debug!(size = state.key_resolvers.len(), "key resolver map coalesced");
                }
            }

            // Dynamic batching: feed the observed end-to-end latency back
            // into the batch interval.
            let config = &data.config;
            let target = self.start_time.elapsed().as_secs_f64()
                * config.commit_batch_interval_latency_fraction;
            let alpha = config.commit_batch_interval_smoother_alpha;
            let smoothed =
                target * alpha + state.commit_batch_interval.as_secs_f64() * (1.0 - alpha);
            state.commit_batch_interval = Duration::from_secs_f64(smoothed.clamp(
                config.commit_batch_interval_min.as_secs_f64(),
                config.commit_batch_interval_max.as_secs_f64(),
            ));
        }

        if let Some(release) = self.release_handle.take() {
            let _ = release.await;
        }
        Ok(())
    }

    /// Apply other proxies' metadata effects, as echoed by the resolvers.
    fn apply_metadata_effect(&mut self, state: &mut CommitState) {
        let mut initial_state = self.is_my_first_batch;
        let version_count = self
            .resolution
            .first()
            .map(|r| r.state_mutations.len())
            .unwrap_or(0);
        for version_index in 0..version_count {
            let txn_count = self.resolution[0].state_mutations[version_index].len();
            for txn_index in 0..txn_count {
                // A txn-state transaction committed iff every resolver agreed.
                let committed = self
                    .resolution
                    .iter()
                    .all(|r| r.state_mutations[version_index][txn_index].committed);
                if committed {
                    let mutations =
                        self.resolution[0].state_mutations[version_index][txn_index]
                            .mutations
                            .clone();
                    crate::metadata::apply_metadata_mutations(state, &mutations, None, false);
                }
            }
            // These writes are logged by the proxy that committed them; the
            // resulting commit message is discarded here.
            let commit = state.txn_state_store.commit(state.version);
            if initial_state {
                initial_state = false;
                commit.discard();
            } else {
                self.store_commits.push(commit);
            }
        }
    }

    /// Combine per-resolver statuses and apply the must-contain rule.
    fn determine_committed_transactions(&mut self, state: &mut CommitState) {
        assert_eq!(self.transaction_resolver_map.len(), self.committed.len());
        let mut next_tr = vec![0usize; self.resolution.len()];
        for index in 0..self.trs.len() {
            if self.skipped[index].is_some() {
                self.committed[index] = CommitStatus::Conflict;
                continue;
            }
            let mut commit = CommitStatus::Committed;
            for &resolver in &self.transaction_resolver_map[index] {
                commit = commit.min(self.resolution[resolver].committed[next_tr[resolver]]);
                next_tr[resolver] += 1;
            }
            self.committed[index] = commit;
        }
        for (resolver, consumed) in next_tr.iter().enumerate() {
            debug_assert_eq!(*consumed, self.resolution[resolver].committed.len());
        }

        self.locked = state
            .txn_state_store
            .read_value(keys::DATABASE_LOCKED_KEY)
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        let must_contain = state
            .txn_state_store
            .read_value(keys::MUST_CONTAIN_SYSTEM_MUTATIONS_KEY)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if must_contain {
            let boundary = keys::non_metadata_system_keys().end;
            for index in 0..self.trs.len() {
                if self.committed[index] != CommitStatus::Committed {
                    continue;
                }
                let touches_system = self.trs[index].transaction.mutations.iter().any(|m| {
                    let probe = if m.kind == sable_core::mutation::MutationKind::ClearRange {
                        &m.param2
                    } else {
                        &m.param1
                    };
                    probe.as_ref() >= boundary.as_ref()
                });
                if !touches_system {
                    self.committed[index] = CommitStatus::Conflict;
                }
            }
        }
    }

    /// First pass over committed transactions: metadata effects.
    fn apply_metadata_to_committed_transactions(&mut self, state: &mut CommitState) {
        let locked = self.locked;
        let committed = &self.committed;
        let trs = &self.trs;
        let to_commit = &mut self.to_commit;
        let mut commit_count = 0usize;
        for (index, tr) in trs.iter().enumerate() {
            if committed[index] == CommitStatus::Committed && (!locked || tr.is_lock_aware()) {
                commit_count += 1;
                crate::metadata::apply_metadata_mutations(
                    state,
                    &tr.transaction.mutations,
                    Some(&mut *to_commit),
                    false,
                );
            }
        }
        self.commit_count += commit_count;
        self.locked_after = state
            .txn_state_store
            .read_value(keys::DATABASE_LOCKED_KEY)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        self.metadata_version_after =
            state.txn_state_store.read_value(keys::METADATA_VERSION_KEY);
        let commit = state.txn_state_store.commit(self.commit_version);
        self.store_commits.push(commit);
    }

    /// Second pass: assign each committed mutation to storage tags, sampling
    /// write costs, and collect backup copies.
    async fn assign_mutations_to_storage_servers(&mut self) {
        let data = self.data.clone();
        let mut yield_bytes = 0usize;

        for index in 0..self.trs.len() {
            if !(self.committed[index] == CommitStatus::Committed
                && (!self.locked || self.trs[index].is_lock_aware()))
            {
                continue;
            }

            if yield_bytes > data.config.desired_total_bytes {
                yield_bytes = 0;
                self.compute_duration += self.compute_start.elapsed();
                tokio::task::yield_now().await;
                self.compute_start = Instant::now();
            }

            let mut state = data.state();
            let has_backup = state
                .backup_ranges
                .iter()
                .any(|(_, dests)| !dests.is_empty());
            let cost_estimation = self.trs[index].commit_cost_estimation.clone();
            let mut clear_costs: VecDeque<(usize, u64)> = cost_estimation
                .as_ref()
                .map(|c| c.clear_idx_costs.clone())
                .unwrap_or_default();
            let total_costs = cost_estimation.as_ref().map(|c| c.write_costs).unwrap_or(0);
            let throttle_tags = self.trs[index].tags.clone();

            let mutations = self.trs[index].transaction.mutations.clone();
            for (mutation_index, mutation) in mutations.iter().enumerate() {
                self.mutation_count += 1;
                self.mutation_bytes += mutation.expected_size() as u64;
                yield_bytes += mutation.expected_size();

                if mutation.is_single_key() {
                    let tags = state.tags_for_key(&mutation.param1);

                    // Expectation: one sample per COMMIT_SAMPLE_COST units.
                    if total_costs > 0 {
                        let cost = write_operation_cost(mutation.expected_size());
                        let multiplier = (total_costs as f64
                            / data.config.commit_sample_cost as f64)
                            .max(1.0);
                        let probability = multiplier * cost as f64 / total_costs as f64;
                        if rand::thread_rng().gen::<f64>() < probability {
                            let (_, info) = state.key_info.range_containing(&mutation.param1);
                            let sources = info.src.clone();
                            let sampled_cost = cost.max(data.config.commit_sample_cost);
                            for server in sources {
                                state.update_ss_tag_cost(server, &throttle_tags, sampled_cost);
                            }
                        }
                    }

                    self.to_commit.add_tags(tags);
                    if *state.cache_info.get(&mutation.param1) {
                        self.to_commit.add_tag(CACHE_TAG);
                    }
                    self.to_commit.add_typed_message(mutation);
                } else {
                    let clear_range =
                        KeyRange::new(mutation.param1.clone(), mutation.param2.clone());
                    let shards = state.key_info.intersecting(&clear_range);
                    let shard_ranges: Vec<KeyRange> =
                        shards.iter().map(|(range, _)| range.clone()).collect();
                    drop(shards);
                    if shard_ranges.len() == 1 {
                        // Fast path: the clear sits inside one shard.
                        let tags = state.tags_for_key(&shard_ranges[0].begin);
                        self.to_commit.add_tags(tags);
                        if clear_costs.front().map(|(i, _)| *i) == Some(mutation_index) {
                            let (_, cost) = clear_costs.pop_front().unwrap_or((0, 0));
                            let (_, info) = state.key_info.range_containing(&shard_ranges[0].begin);
                            for server in info.src.clone() {
                                state.update_ss_tag_cost(server, &throttle_tags, cost);
                            }
                        }
                    } else {
                        let mut all_tags = Vec::new();
                        for shard in &shard_ranges {
                            all_tags.extend(state.tags_for_key(&shard.begin));
                            if clear_costs.front().map(|(i, _)| *i) == Some(mutation_index) {
                                let (_, cost) = clear_costs.pop_front().unwrap_or((0, 0));
                                let (_, info) = state.key_info.range_containing(&shard.begin);
                                for server in info.src.clone() {
                                    state.update_ss_tag_cost(server, &throttle_tags, cost);
                                }
                            }
                        }
                        all_tags.sort();
                        all_tags.dedup();
                        self.to_commit.add_tags(all_tags);
                    }
                    if state.needs_cache_tag(&clear_range) {
                        self.to_commit.add_tag(CACHE_TAG);
                    }
                    self.to_commit.add_typed_message(mutation);
                }

                // Backup copies for mutations in the backed-up key space.
                if !has_backup
                    || !(keys::normal_keys().contains(&mutation.param1)
                        || mutation.param1.as_ref() == keys::METADATA_VERSION_KEY)
                {
                    continue;
                }
                if mutation.is_single_key() {
                    for dest in state.backup_ranges.get(&mutation.param1).clone() {
                        self.log_range_mutations
                            .entry(dest)
                            .or_default()
                            .push(mutation.clone());
                    }
                } else {
                    let mutation_range =
                        KeyRange::new(mutation.param1.clone(), mutation.param2.clone());
                    let intersections: Vec<(KeyRange, std::collections::BTreeSet<Bytes>)> = state
                        .backup_ranges
                        .intersecting(&mutation_range)
                        .into_iter()
                        .map(|(range, dests)| (range, dests.clone()))
                        .collect();
                    for (backup_range, dests) in intersections {
                        if dests.is_empty() {
                            continue;
                        }
                        let clipped = mutation_range.intersection(&backup_range);
                        if clipped.is_empty() {
                            continue;
                        }
                        let backup_mutation =
                            Mutation::clear_range(clipped.begin.clone(), clipped.end.clone());
                        for dest in dests {
                            self.log_range_mutations
                                .entry(dest)
                                .or_default()
                                .push(backup_mutation.clone());
                        }
                    }
                }
            }

            if let Some(cost) = cost_estimation {
                data.stats
                    .txn_expensive_clear_cost_est_count
                    .fetch_add(cost.expensive_cost_est_count, Ordering::Relaxed);
            }
        }
    }

    /// Serialize accumulated backup mutations as versioned block parts keyed
    /// under each destination prefix.
    async fn add_backup_mutations(&mut self) {
        if self.log_range_mutations.is_empty() {
            return;
        }
        let data = self.data.clone();
        let block_index =
            (self.commit_version / data.config.log_range_block_size) as i64;
        let hash_byte = version_block_hash(block_index);
        let mut yield_bytes = 0usize;

        let log_range_mutations = std::mem::take(&mut self.log_range_mutations);
        for (dest, mutations) in log_range_mutations {
            // Serialized form: count, then each encoded mutation.
            let mut value = Vec::new();
            value.extend_from_slice(&(mutations.len() as u32).to_be_bytes());
            for mutation in &mutations {
                let encoded = mutation.encode();
                yield_bytes += encoded.len();
                value.extend_from_slice(&encoded);
                if yield_bytes > data.config.desired_total_bytes {
                    yield_bytes = 0;
                    self.compute_duration += self.compute_start.elapsed();
                    tokio::task::yield_now().await;
                    self.compute_start = Instant::now();
                }
            }

            let mut key_base = Vec::with_capacity(dest.len() + 9);
            key_base.extend_from_slice(&dest);
            key_base.push(hash_byte);
            key_base.extend_from_slice(&self.commit_version.to_be_bytes());

            let block = data.config.mutation_block_size;
            let mut part = 0u32;
            let mut offset = 0usize;
            while offset < value.len() {
                let end = (offset + block).min(value.len());
                let mut part_key = key_base.clone();
                part_key.extend_from_slice(&part.to_be_bytes());
                let part_key = Bytes::from(part_key);
                debug_assert!(part_key.starts_with(&dest));

                let backup_mutation =
                    Mutation::set(part_key.clone(), Bytes::copy_from_slice(&value[offset..end]));
                let mut state = data.state();
                let tags = state.tags_for_key(&part_key);
                drop(state);
                self.to_commit.add_tags(tags);
                self.to_commit.add_typed_message(&backup_mutation);

                part += 1;
                offset = end;
            }
        }
    }
}

/// Low byte of a stable hash of the backup block index.
fn version_block_hash(block_index: i64) -> u8 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    block_index.hash(&mut hasher);
    hasher.finish() as u8
}

/// Every resolver must report the same state-mutation matrix shape.
fn assert_resolution_state_mutations_size_consistent(
    resolution: &[ResolveTransactionBatchReply],
) {
    for r in 1..resolution.len() {
        assert_eq!(
            resolution[r].state_mutations.len(),
            resolution[0].state_mutations.len(),
            "state-mutation version count must agree across resolvers"
        );
        for v in 0..resolution[r].state_mutations.len() {
            assert_eq!(
                resolution[r].state_mutations[v].len(),
                resolution[0].state_mutations[v].len(),
                "state-mutation transaction count must agree across resolvers"
            );
        }
    }
}
