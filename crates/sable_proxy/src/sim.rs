//! In-process collaborators for tests and the workload driver.
//!
//! These implement the collaborator contracts the proxies consume — version
//! oracle, conflict-set resolvers, replicated log, storage, rate keeper — in
//! memory, going no further than what the proxies require. `SimCluster`
//! wires them to a commit proxy and a read-version proxy and hands out
//! client databases.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sable_core::atomic::apply_atomic_op;
use sable_core::interfaces::{
    CommitCost, LogSystem, MasterClient, RateKeeperClient, ResolverClient,
};
use sable_core::keys::{
    encode_key_servers_value, encode_server_tag_value, key_servers_key_for, server_tag_key_for,
};
use sable_core::messages::{
    CommitStatus, CommitTransactionRequest, GetCommitVersionReply, GetCommitVersionRequest,
    GetKeyServerLocationsRequest, GetRateInfoReply, GetRateInfoRequest,
    GetRawCommittedVersionReply, GetReadVersionRequest, LogPushRequest, LogQueuingMetrics,
    PrioritizedThrottles, ReportRawCommittedVersionRequest, ResolveTransactionBatchReply,
    ResolveTransactionBatchRequest, ResolverChange, StateTransaction, TxnStateRequest,
};
use sable_core::mutation::{Mutation, MutationKind};
use sable_core::notified::NotifiedVersion;
use sable_core::types::{KeyRange, Tag, Version, VERSIONS_PER_SECOND};
use sable_core::StoreError;
use tokio::sync::{mpsc, oneshot};

use crate::client::Database;
use crate::commit_data::CommitProxyData;
use crate::commit_proxy::{commit_proxy_server, CommitProxyChannels};
use crate::config::{CommitProxyConfig, GrvProxyConfig, TransactionLimits};
use crate::grv::{grv_proxy_server, GrvProxyData};
use crate::util::now_seconds;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Master

struct MasterState {
    last_assigned: Version,
    last_assign_time: f64,
    live_committed: Version,
    locked: bool,
    metadata_version: Option<Bytes>,
    min_known_committed: Version,
    /// Per requesting proxy: highest request number and its cached reply.
    replies: HashMap<u64, (u64, GetCommitVersionReply)>,
    pending_resolver_changes: Vec<ResolverChange>,
}

/// Sequencer: assigns strictly increasing commit versions and tracks the
/// cluster-wide live committed version.
pub struct SimMaster {
    state: Mutex<MasterState>,
}

impl SimMaster {
    pub fn new(recovery_version: Version) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MasterState {
                last_assigned: recovery_version,
                last_assign_time: now_seconds(),
                live_committed: recovery_version,
                locked: false,
                metadata_version: None,
                min_known_committed: 0,
                replies: HashMap::new(),
                pending_resolver_changes: Vec::new(),
            }),
        })
    }

    /// Queue a resolver reassignment for the next version grant.
    pub fn schedule_resolver_change(&self, range: KeyRange, dest: usize) {
        lock(&self.state)
            .pending_resolver_changes
            .push(ResolverChange { range, dest });
    }

    pub fn live_committed_version(&self) -> Version {
        lock(&self.state).live_committed
    }
}

#[async_trait]
impl MasterClient for SimMaster {
    async fn get_commit_version(
        &self,
        req: GetCommitVersionRequest,
    ) -> anyhow::Result<GetCommitVersionReply> {
        let mut state = lock(&self.state);
        if let Some((highest, cached)) = state.replies.get(&req.requesting_proxy) {
            if req.request_num <= *highest {
                return Ok(cached.clone());
            }
        }
        let now = now_seconds();
        let elapsed = (now - state.last_assign_time).max(0.0);
        let step = ((elapsed * VERSIONS_PER_SECOND as f64) as i64).clamp(1, VERSIONS_PER_SECOND);
        let prev_version = state.last_assigned;
        let version = prev_version + step;
        state.last_assigned = version;
        state.last_assign_time = now;
        let reply = GetCommitVersionReply {
            version,
            prev_version,
            request_num: req.request_num,
            resolver_changes: std::mem::take(&mut state.pending_resolver_changes),
            resolver_changes_version: version,
        };
        state
            .replies
            .insert(req.requesting_proxy, (req.request_num, reply.clone()));
        Ok(reply)
    }

    async fn get_live_committed_version(&self) -> anyhow::Result<GetRawCommittedVersionReply> {
        let state = lock(&self.state);
        Ok(GetRawCommittedVersionReply {
            version: state.live_committed,
            locked: state.locked,
            metadata_version: state.metadata_version.clone(),
            min_known_committed_version: state.min_known_committed,
        })
    }

    async fn report_live_committed_version(
        &self,
        req: ReportRawCommittedVersionRequest,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if req.version > state.live_committed {
            state.live_committed = req.version;
            state.locked = req.locked;
            state.metadata_version = req.metadata_version;
        }
        state.min_known_committed = state.min_known_committed.max(req.min_known_committed_version);
        Ok(())
    }

    async fn change_coordinators(&self, _new_coordinators: Bytes) -> anyhow::Result<()> {
        // The real coordinator change tears the transaction subsystem down
        // rather than replying.
        Err(anyhow::Error::new(StoreError::CoordinatorsChanged))
    }
}

// ---------------------------------------------------------------------------
// Resolver

struct ResolverState {
    /// Committed write ranges, newest last.
    writes: Vec<(Version, KeyRange)>,
    /// Txn-state transactions recorded per processed version.
    recent_state_txns: BTreeMap<Version, Vec<StateTransaction>>,
    /// Snapshots below this cannot be checked any more.
    oldest_version: Version,
}

/// One shard of the conflict-detection service: read/write range
/// intersection over a sliding MVCC window.
pub struct SimResolver {
    window_versions: i64,
    state: Mutex<ResolverState>,
    processed: NotifiedVersion,
}

impl SimResolver {
    pub fn new(recovery_version: Version, window_versions: i64) -> Arc<Self> {
        Arc::new(Self {
            window_versions,
            state: Mutex::new(ResolverState {
                writes: Vec::new(),
                recent_state_txns: BTreeMap::new(),
                oldest_version: 0,
            }),
            processed: NotifiedVersion::new(recovery_version),
        })
    }
}

#[async_trait]
impl ResolverClient for SimResolver {
    async fn resolve(
        &self,
        req: ResolveTransactionBatchRequest,
    ) -> anyhow::Result<ResolveTransactionBatchReply> {
        // Batches are checked in version order; requests can arrive out of
        // order because proxies pipeline them.
        self.processed.when_at_least(req.prev_version).await;

        let mut state = lock(&self.state);
        let mut committed = Vec::with_capacity(req.transactions.len());
        let mut conflicting_key_range_map = Vec::with_capacity(req.transactions.len());
        let mut batch_writes: Vec<KeyRange> = Vec::new();

        for tr in &req.transactions {
            let mut conflicting_ranges = Vec::new();
            let status = if tr.read_snapshot < state.oldest_version {
                CommitStatus::TooOld
            } else {
                for (index, range) in tr.read_conflict_ranges.iter().enumerate() {
                    let history_hit = state
                        .writes
                        .iter()
                        .any(|(v, w)| *v > tr.read_snapshot && w.intersects(range));
                    let batch_hit = batch_writes.iter().any(|w| w.intersects(range));
                    if history_hit || batch_hit {
                        conflicting_ranges.push(index);
                    }
                }
                if conflicting_ranges.is_empty() {
                    CommitStatus::Committed
                } else {
                    CommitStatus::Conflict
                }
            };
            if status == CommitStatus::Committed {
                batch_writes.extend(tr.write_conflict_ranges.iter().cloned());
            }
            committed.push(status);
            conflicting_key_range_map.push(conflicting_ranges);
        }

        // Record this batch's committed writes and slide the window.
        for range in batch_writes {
            state.writes.push((req.version, range));
        }
        state.oldest_version = state
            .oldest_version
            .max(req.version - self.window_versions);
        let floor = state.oldest_version;
        state.writes.retain(|(v, _)| *v > floor);

        // Remember txn-state outcomes so other proxies can learn them.
        let recorded: Vec<StateTransaction> = req
            .txn_state_transactions
            .iter()
            .map(|&txn_index| StateTransaction {
                committed: committed.get(txn_index) == Some(&CommitStatus::Committed),
                mutations: req
                    .transactions
                    .get(txn_index)
                    .map(|t| t.mutations.clone())
                    .unwrap_or_default(),
            })
            .collect();
        state.recent_state_txns.insert(req.version, recorded);
        let stale: Vec<Version> = state
            .recent_state_txns
            .range(..floor)
            .map(|(v, _)| *v)
            .collect();
        for version in stale {
            state.recent_state_txns.remove(&version);
        }

        // Echo other proxies' txn-state activity strictly between the
        // requester's last received version and this one.
        let state_mutations: Vec<Vec<StateTransaction>> = state
            .recent_state_txns
            .range(req.last_received_version + 1..req.version)
            .map(|(_, txns)| txns.clone())
            .collect();

        drop(state);
        self.processed.set(req.version);
        Ok(ResolveTransactionBatchReply {
            committed,
            state_mutations,
            conflicting_key_range_map,
        })
    }
}

// ---------------------------------------------------------------------------
// Storage

/// Shared slot holding a watch's completion channel; taken either by the
/// storage trigger or by transaction cancellation, whichever comes first.
pub type WatchSlot = Arc<Mutex<Option<oneshot::Sender<Result<(), StoreError>>>>>;

struct StorageState {
    data: BTreeMap<Bytes, Vec<(Version, Option<Bytes>)>>,
    latest_version: Version,
    watches: HashMap<Bytes, Vec<(Option<Bytes>, WatchSlot)>>,
}

/// Versioned in-memory storage server; applies tagged log messages.
pub struct SimStorage {
    value_size_limit: usize,
    state: Mutex<StorageState>,
}

impl SimStorage {
    pub fn new(value_size_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            value_size_limit,
            state: Mutex::new(StorageState {
                data: BTreeMap::new(),
                latest_version: 0,
                watches: HashMap::new(),
            }),
        })
    }

    fn latest_at(entries: &[(Version, Option<Bytes>)], version: Version) -> Option<Bytes> {
        entries
            .iter()
            .rev()
            .find(|(v, _)| *v <= version)
            .and_then(|(_, value)| value.clone())
    }

    /// Apply one mutation at `version`.
    pub fn apply(&self, mutation: &Mutation, version: Version) {
        let mut state = lock(&self.state);
        state.latest_version = state.latest_version.max(version);
        match mutation.kind {
            MutationKind::SetValue => {
                let value = Some(mutation.param2.clone());
                state
                    .data
                    .entry(mutation.param1.clone())
                    .or_default()
                    .push((version, value.clone()));
                Self::fire_watches(&mut state, &mutation.param1, &value);
            }
            MutationKind::ClearRange => {
                let range = KeyRange::new(mutation.param1.clone(), mutation.param2.clone());
                let affected: Vec<Bytes> = state
                    .data
                    .range(range.begin.clone()..range.end.clone())
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in affected {
                    if let Some(entries) = state.data.get_mut(&key) {
                        entries.push((version, None));
                    }
                    Self::fire_watches(&mut state, &key, &None);
                }
            }
            _ => {
                let existing = state
                    .data
                    .get(&mutation.param1)
                    .and_then(|entries| Self::latest_at(entries, version));
                let result = apply_atomic_op(
                    mutation.kind,
                    existing.as_deref(),
                    &mutation.param2,
                    self.value_size_limit,
                );
                let value = result.map(Bytes::from);
                state
                    .data
                    .entry(mutation.param1.clone())
                    .or_default()
                    .push((version, value.clone()));
                Self::fire_watches(&mut state, &mutation.param1, &value);
            }
        }
    }

    fn fire_watches(state: &mut StorageState, key: &Bytes, new_value: &Option<Bytes>) {
        if let Some(watchers) = state.watches.get_mut(key) {
            watchers.retain(|(expected, slot)| {
                if expected == new_value {
                    return true;
                }
                if let Some(sender) = lock(slot).take() {
                    let _ = sender.send(Ok(()));
                }
                false
            });
        }
    }

    pub fn latest_version(&self) -> Version {
        lock(&self.state).latest_version
    }

    pub fn get(&self, key: &[u8], version: Version) -> Option<Bytes> {
        let state = lock(&self.state);
        state
            .data
            .get(key)
            .and_then(|entries| Self::latest_at(entries, version))
    }

    /// Range read at `version`: ordered key/value pairs plus a more flag.
    pub fn get_range(
        &self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
        version: Version,
    ) -> (Vec<(Bytes, Bytes)>, bool) {
        let state = lock(&self.state);
        let mut visible: Vec<(Bytes, Bytes)> = state
            .data
            .range(range.begin.clone()..range.end.clone())
            .filter_map(|(key, entries)| {
                Self::latest_at(entries, version).map(|value| (key.clone(), value))
            })
            .collect();
        if reverse {
            visible.reverse();
        }
        let more = visible.len() > limit;
        visible.truncate(limit);
        (visible, more)
    }

    /// Register a watch that fires when the key's value departs from
    /// `expected`.
    pub fn watch(&self, key: Bytes, expected: Option<Bytes>) -> (WatchSlot, oneshot::Receiver<Result<(), StoreError>>) {
        let (tx, rx) = oneshot::channel();
        let slot: WatchSlot = Arc::new(Mutex::new(Some(tx)));
        lock(&self.state)
            .watches
            .entry(key)
            .or_default()
            .push((expected, slot.clone()));
        (slot, rx)
    }
}

// ---------------------------------------------------------------------------
// Log system

struct LogState {
    last_version: Version,
    txs_popped: Version,
    remote_txs_popped: Version,
    pushes: u64,
}

/// Ordered in-memory replicated log that feeds the storage server.
pub struct SimLog {
    storage: Arc<SimStorage>,
    has_remote: bool,
    state: Mutex<LogState>,
    processed: NotifiedVersion,
}

impl SimLog {
    pub fn new(storage: Arc<SimStorage>, recovery_version: Version, has_remote: bool) -> Arc<Self> {
        Arc::new(Self {
            storage,
            has_remote,
            state: Mutex::new(LogState {
                last_version: recovery_version,
                txs_popped: 0,
                remote_txs_popped: 0,
                pushes: 0,
            }),
            processed: NotifiedVersion::new(recovery_version),
        })
    }

    pub fn txs_popped(&self) -> (Version, Version) {
        let state = lock(&self.state);
        (state.txs_popped, state.remote_txs_popped)
    }

    pub fn pushes(&self) -> u64 {
        lock(&self.state).pushes
    }
}

#[async_trait]
impl LogSystem for SimLog {
    async fn push(&self, req: LogPushRequest) -> anyhow::Result<Version> {
        // Pushes chain on prev version, so the log applies in version order
        // even when proxies pipeline.
        self.processed.when_at_least(req.prev_version).await;
        {
            let mut state = lock(&self.state);
            if state.last_version != req.prev_version {
                tracing::warn!(
                    last = state.last_version,
                    prev = req.prev_version,
                    "log push arrived with unexpected previous version"
                );
            }
            state.last_version = req.version;
            state.pushes += 1;
        }
        for message in &req.messages {
            // Only storage tags are materialized; txs and router tags stay
            // in the log.
            if message.tags.iter().any(|tag| tag.locality >= 0) {
                match Mutation::decode(&message.message) {
                    Ok(mutation) => self.storage.apply(&mutation, req.version),
                    Err(err) => {
                        tracing::warn!(error = ?err, "undecodable log message");
                    }
                }
            }
        }
        self.processed.set(req.version);
        Ok(req.version)
    }

    fn pop_txs(&self, upto: Version, locality: Option<i8>) {
        let mut state = lock(&self.state);
        match locality {
            None => state.txs_popped = state.txs_popped.max(upto),
            Some(_) => state.remote_txs_popped = state.remote_txs_popped.max(upto),
        }
    }

    async fn confirm_epoch_live(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn has_remote_logs(&self) -> bool {
        self.has_remote
    }

    async fn remote_queuing_metrics(&self) -> anyhow::Result<Vec<LogQueuingMetrics>> {
        anyhow::ensure!(self.has_remote, "no remote logs recruited");
        Ok(vec![LogQueuingMetrics {
            version: lock(&self.state).last_version,
        }])
    }
}

// ---------------------------------------------------------------------------
// Rate keeper

struct RateKeeperState {
    transaction_rate: f64,
    batch_transaction_rate: f64,
    lease_duration: Duration,
    throttled_tags: Option<PrioritizedThrottles>,
    rate_requests: u64,
    reported_costs: Vec<HashMap<u64, HashMap<Bytes, CommitCost>>>,
    seen_tag_counts: HashMap<Bytes, u64>,
}

/// Configurable rate keeper: hands out fixed rates and records reports.
pub struct SimRateKeeper {
    state: Mutex<RateKeeperState>,
}

impl SimRateKeeper {
    pub fn new(transaction_rate: f64, batch_transaction_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RateKeeperState {
                transaction_rate,
                batch_transaction_rate,
                lease_duration: Duration::from_secs(1),
                throttled_tags: None,
                rate_requests: 0,
                reported_costs: Vec::new(),
                seen_tag_counts: HashMap::new(),
            }),
        })
    }

    pub fn set_rates(&self, transaction_rate: f64, batch_transaction_rate: f64) {
        let mut state = lock(&self.state);
        state.transaction_rate = transaction_rate;
        state.batch_transaction_rate = batch_transaction_rate;
    }

    pub fn set_throttled_tags(&self, throttles: PrioritizedThrottles) {
        lock(&self.state).throttled_tags = Some(throttles);
    }

    pub fn rate_requests(&self) -> u64 {
        lock(&self.state).rate_requests
    }

    pub fn reported_costs(&self) -> Vec<HashMap<u64, HashMap<Bytes, CommitCost>>> {
        lock(&self.state).reported_costs.clone()
    }

    pub fn seen_tag_counts(&self) -> HashMap<Bytes, u64> {
        lock(&self.state).seen_tag_counts.clone()
    }
}

#[async_trait]
impl RateKeeperClient for SimRateKeeper {
    async fn get_rate_info(&self, req: GetRateInfoRequest) -> anyhow::Result<GetRateInfoReply> {
        let mut state = lock(&self.state);
        state.rate_requests += 1;
        for (tag, count) in req.tag_counts {
            *state.seen_tag_counts.entry(tag).or_insert(0) += count;
        }
        Ok(GetRateInfoReply {
            transaction_rate: state.transaction_rate,
            batch_transaction_rate: state.batch_transaction_rate,
            lease_duration: state.lease_duration,
            throttled_tags: state.throttled_tags.take(),
        })
    }

    async fn report_commit_cost(
        &self,
        costs: HashMap<u64, HashMap<Bytes, CommitCost>>,
    ) -> anyhow::Result<()> {
        lock(&self.state).reported_costs.push(costs);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cluster harness

/// Unit-test helper: one of each collaborator with a single storage server.
pub fn sim_collaborators(
    resolver_count: usize,
    recovery_version: Version,
) -> (
    Arc<dyn MasterClient>,
    Vec<Arc<dyn ResolverClient>>,
    Arc<dyn LogSystem>,
    Arc<dyn RateKeeperClient>,
    Arc<SimStorage>,
) {
    let limits = TransactionLimits::default();
    let storage = SimStorage::new(limits.value_size_limit);
    let master = SimMaster::new(recovery_version);
    let resolvers: Vec<Arc<dyn ResolverClient>> = (0..resolver_count.max(1))
        .map(|_| SimResolver::new(recovery_version, 5_000_000) as Arc<dyn ResolverClient>)
        .collect();
    let log = SimLog::new(storage.clone(), recovery_version, false);
    let rate_keeper = SimRateKeeper::new(1e6, 1e6);
    (
        master as Arc<dyn MasterClient>,
        resolvers,
        log as Arc<dyn LogSystem>,
        rate_keeper as Arc<dyn RateKeeperClient>,
        storage,
    )
}

/// Configuration of an in-process cluster.
#[derive(Clone)]
pub struct SimClusterConfig {
    pub resolver_count: usize,
    pub recovery_version: Version,
    pub commit: CommitProxyConfig,
    pub grv: GrvProxyConfig,
    pub limits: TransactionLimits,
    pub transaction_rate: f64,
    pub batch_transaction_rate: f64,
    pub remote_logs: bool,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        Self {
            resolver_count: 2,
            recovery_version: 1,
            commit: CommitProxyConfig::default(),
            grv: GrvProxyConfig::default(),
            limits: TransactionLimits::default(),
            transaction_rate: 1e6,
            batch_transaction_rate: 1e6,
            remote_logs: false,
        }
    }
}

/// A fully wired single-process cluster: collaborators plus both proxies.
pub struct SimCluster {
    pub master: Arc<SimMaster>,
    pub resolvers: Vec<Arc<SimResolver>>,
    pub log: Arc<SimLog>,
    pub storage: Arc<SimStorage>,
    pub rate_keeper: Arc<SimRateKeeper>,
    pub commit_data: Arc<CommitProxyData>,
    pub grv_data: Arc<GrvProxyData>,
    commit_tx: mpsc::UnboundedSender<CommitTransactionRequest>,
    grv_tx: mpsc::UnboundedSender<GetReadVersionRequest>,
    key_location_tx: mpsc::UnboundedSender<GetKeyServerLocationsRequest>,
    limits: TransactionLimits,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SimCluster {
    /// Start the cluster and seed the txn-state store with one storage
    /// server (id 1, tag (0,1)) owning the whole key space.
    pub async fn start(config: SimClusterConfig) -> anyhow::Result<Self> {
        let master = SimMaster::new(config.recovery_version);
        let resolvers: Vec<Arc<SimResolver>> = (0..config.resolver_count.max(1))
            .map(|_| {
                SimResolver::new(
                    config.recovery_version,
                    config.commit.max_write_transaction_life_versions,
                )
            })
            .collect();
        let storage = SimStorage::new(config.limits.value_size_limit);
        let log = SimLog::new(storage.clone(), config.recovery_version, config.remote_logs);
        let rate_keeper =
            SimRateKeeper::new(config.transaction_rate, config.batch_transaction_rate);

        let commit_data = CommitProxyData::new(
            1,
            config.commit.clone(),
            config.recovery_version,
            master.clone(),
            resolvers
                .iter()
                .map(|r| r.clone() as Arc<dyn ResolverClient>)
                .collect(),
            log.clone(),
            rate_keeper.clone(),
        );
        let grv_data = GrvProxyData::new(
            2,
            config.grv.clone(),
            master.clone(),
            log.clone(),
            rate_keeper.clone(),
        );

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let (txn_state_tx, txn_state_rx) = mpsc::unbounded_channel();
        let (key_location_tx, key_location_rx) = mpsc::unbounded_channel();
        let (grv_tx, grv_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn({
            let data = commit_data.clone();
            async move {
                if let Err(err) = commit_proxy_server(
                    data,
                    CommitProxyChannels {
                        commits: commit_rx,
                        txn_state: txn_state_rx,
                        key_locations: key_location_rx,
                    },
                )
                .await
                {
                    tracing::error!(error = ?err, "commit proxy failed");
                }
            }
        }));
        tasks.push(tokio::spawn({
            let data = grv_data.clone();
            async move {
                if let Err(err) = grv_proxy_server(data, grv_rx).await {
                    tracing::error!(error = ?err, "grv proxy failed");
                }
            }
        }));

        // Seed: one storage server owning everything.
        let seed = vec![
            (server_tag_key_for(1), encode_server_tag_value(Tag::new(0, 1))),
            (key_servers_key_for(b""), encode_key_servers_value(&[1], &[])),
        ];
        let (reply_tx, reply_rx) = oneshot::channel();
        txn_state_tx
            .send(TxnStateRequest {
                data: seed,
                sequence: 0,
                last: true,
                reply: reply_tx,
            })
            .map_err(|_| anyhow::anyhow!("commit proxy gone before seeding"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("seeding reply dropped"))?
            .map_err(|err| anyhow::anyhow!("seeding failed: {err}"))?;

        Ok(Self {
            master,
            resolvers,
            log,
            storage,
            rate_keeper,
            commit_data,
            grv_data,
            commit_tx,
            grv_tx,
            key_location_tx,
            limits: config.limits,
            tasks,
        })
    }

    /// A client database handle bound to this cluster.
    pub fn database(&self) -> Database {
        Database::new(
            self.grv_tx.clone(),
            self.commit_tx.clone(),
            self.storage.clone(),
            self.limits.clone(),
        )
    }

    /// Raw key-location query against the commit proxy.
    pub fn key_location_sender(&self) -> mpsc::UnboundedSender<GetKeyServerLocationsRequest> {
        self.key_location_tx.clone()
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
