//! Proxy-wide state for the commit role.
//!
//! One `CommitProxyData` exists per proxy process. Counters and version
//! clocks are atomics/watches; everything map-shaped lives in `CommitState`
//! behind a `std::sync::Mutex` that is only ever held between suspension
//! points, which reproduces the single-threaded cooperative discipline the
//! pipeline's correctness depends on.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sable_core::interfaces::{CommitCost, LogSystem, MasterClient, RateKeeperClient, ResolverClient};
use sable_core::keys::{self, decode_server_tag_value};
use sable_core::notified::NotifiedVersion;
use sable_core::rangemap::RangeMap;
use sable_core::types::{KeyRange, Tag, TransactionTag, Version, INVALID_TAG};
use tokio::sync::watch;

use crate::config::CommitProxyConfig;
use crate::txn_state::TxnStateStore;

/// Storage responsibility of one shard: tags plus source/destination servers.
///
/// The tag vector is a cache; a server-tag change empties every vector so it
/// is repopulated lazily from the storage cache on next use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerCacheInfo {
    pub tags: Vec<Tag>,
    pub src: Vec<u64>,
    pub dest: Vec<u64>,
}

/// Latched one-way flag, set once the txn-state store is valid.
#[derive(Debug)]
pub struct ValidState {
    tx: watch::Sender<bool>,
}

impl ValidState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set(&self) {
        self.tx.send_if_modified(|v| {
            if *v {
                false
            } else {
                *v = true;
                true
            }
        });
    }

    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for ValidState {
    fn default() -> Self {
        Self::new()
    }
}

/// Commit-proxy counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub txn_commit_in: AtomicU64,
    pub txn_commit_version_assigned: AtomicU64,
    pub txn_commit_resolving: AtomicU64,
    pub txn_commit_resolved: AtomicU64,
    pub txn_commit_out: AtomicU64,
    pub txn_commit_out_success: AtomicU64,
    pub txn_commit_errors: AtomicU64,
    pub txn_conflicts: AtomicU64,
    pub commit_batch_in: AtomicU64,
    pub commit_batch_out: AtomicU64,
    pub mutations: AtomicU64,
    pub mutation_bytes: AtomicU64,
    pub conflict_ranges: AtomicU64,
    pub key_server_location_in: AtomicU64,
    pub key_server_location_out: AtomicU64,
    pub key_server_location_errors: AtomicU64,
    pub txn_expensive_clear_cost_est_count: AtomicU64,
    pub last_commit_version_assigned: AtomicI64,
    /// End-to-end latency of the most recent commit, microseconds.
    pub last_commit_latency_us: AtomicU64,
}

/// Map-shaped mutable state; guarded by the proxy-wide mutex.
#[derive(Debug)]
pub struct CommitState {
    /// Version at which the txn-state store is up to date.
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Bytes>,
    /// Key range → ordered (effective-from version, resolver id) history.
    pub key_resolvers: RangeMap<VecDeque<(Version, usize)>>,
    /// Key range → storage responsibility.
    pub key_info: RangeMap<ServerCacheInfo>,
    /// Key range → cached flag.
    pub cache_info: RangeMap<bool>,
    /// Key range → backup destination prefixes.
    pub backup_ranges: RangeMap<BTreeSet<Bytes>>,
    pub txn_state_store: TxnStateStore,
    /// Storage server id → tag, filled lazily from the txn-state store.
    pub storage_cache: HashMap<u64, Tag>,
    /// Bounded history of (commit version, txs pop-to).
    pub txs_pop_versions: VecDeque<(Version, Version)>,
    pub last_txs_pop: Version,
    pub pop_remote_txs: bool,
    pub commit_batch_interval: Duration,
    /// Per latency bucket, smoothed seconds of compute per operation.
    pub commit_compute_per_operation: Vec<f64>,
    pub last_coalesce_time: Instant,
    /// Sampled commit costs awaiting the next rate-keeper report.
    pub ss_tag_commit_cost: HashMap<u64, HashMap<TransactionTag, CommitCost>>,
}

impl CommitState {
    pub(crate) fn new(config: &CommitProxyConfig) -> Self {
        let mut key_resolvers = RangeMap::new(keys::all_keys(), VecDeque::new());
        // Until the master reports changes, resolver 0 owns the whole space
        // from the beginning of time.
        for entry in key_resolvers.modify(&keys::all_keys()) {
            entry.push_back((0, 0));
        }
        Self {
            version: 0,
            locked: false,
            metadata_version: None,
            key_resolvers,
            key_info: RangeMap::new(keys::all_keys(), ServerCacheInfo::default()),
            cache_info: RangeMap::new(keys::all_keys(), false),
            backup_ranges: RangeMap::new(keys::all_keys(), BTreeSet::new()),
            txn_state_store: TxnStateStore::new(),
            storage_cache: HashMap::new(),
            txs_pop_versions: VecDeque::new(),
            last_txs_pop: 0,
            pop_remote_txs: false,
            commit_batch_interval: config.commit_batch_interval_min,
            commit_compute_per_operation: vec![0.0; config.proxy_compute_buckets],
            last_coalesce_time: Instant::now(),
            ss_tag_commit_cost: HashMap::new(),
        }
    }

    /// Tag of a storage server, from the cache or the txn-state store.
    pub fn storage_tag(&mut self, server: u64) -> anyhow::Result<Tag> {
        if let Some(tag) = self.storage_cache.get(&server) {
            return Ok(*tag);
        }
        let value = self
            .txn_state_store
            .read_value(&keys::server_tag_key_for(server))
            .ok_or_else(|| anyhow::anyhow!("no serverTag entry for storage server {server}"))?;
        let tag = decode_server_tag_value(&value)?;
        anyhow::ensure!(tag != INVALID_TAG, "storage server {server} carries the invalid tag");
        self.storage_cache.insert(server, tag);
        Ok(tag)
    }

    /// Tags responsible for `key`, repopulating the shard's cache if a tag
    /// change emptied it.
    pub fn tags_for_key(&mut self, key: &[u8]) -> Vec<Tag> {
        let (range, info) = self.key_info.range_containing(key);
        if !info.tags.is_empty() {
            return info.tags.clone();
        }
        let (src, dest) = (info.src.clone(), info.dest.clone());
        let mut tags = Vec::with_capacity(src.len() + dest.len());
        for server in src.iter().chain(dest.iter()) {
            match self.storage_tag(*server) {
                Ok(tag) => tags.push(tag),
                Err(err) => {
                    tracing::warn!(server, error = ?err, "storage tag lookup failed");
                }
            }
        }
        tags.sort();
        tags.dedup();
        for entry in self.key_info.modify(&range) {
            entry.tags = tags.clone();
        }
        tags
    }

    /// Empty every cached tag vector; repopulated lazily to avoid a slow task.
    pub fn invalidate_cached_tags(&mut self) {
        for entry in self.key_info.modify(&keys::all_keys()) {
            entry.tags.clear();
        }
    }

    /// True if any part of `range` is marked cached.
    pub fn needs_cache_tag(&self, range: &KeyRange) -> bool {
        self.cache_info
            .intersecting(range)
            .iter()
            .any(|(_, cached)| **cached)
    }

    /// Record a sampled write cost against each throttling tag of a commit.
    pub fn update_ss_tag_cost(&mut self, server: u64, tags: &[TransactionTag], cost: u64) {
        let per_server = self.ss_tag_commit_cost.entry(server).or_default();
        for tag in tags {
            let entry = per_server.entry(tag.clone()).or_default();
            entry.ops_sum += 1;
            entry.cost_sum += cost;
        }
    }
}

/// Everything one commit proxy owns.
pub struct CommitProxyData {
    pub dbgid: u64,
    pub config: CommitProxyConfig,
    pub master: Arc<dyn MasterClient>,
    pub resolvers: Vec<Arc<dyn ResolverClient>>,
    pub log_system: Arc<dyn LogSystem>,
    pub rate_keeper: Arc<dyn RateKeeperClient>,

    /// Durably committed version (provided recovery succeeds).
    pub committed_version: NotifiedVersion,
    /// Ordering barrier: highest batch number past resolution.
    pub latest_local_commit_batch_resolving: NotifiedVersion,
    /// Ordering barrier: highest batch number whose push was issued.
    pub latest_local_commit_batch_logging: NotifiedVersion,
    pub min_known_committed_version: AtomicI64,
    pub commit_batches_mem_bytes: Arc<AtomicI64>,
    pub local_commit_batches_started: AtomicI64,
    pub commit_version_request_number: AtomicU64,
    pub most_recent_processed_request_number: AtomicU64,
    /// Set once the txn-state store has been seeded and versioned.
    pub valid_state: ValidState,
    pub state: Mutex<CommitState>,
    pub stats: ProxyStats,
}

impl CommitProxyData {
    pub fn new(
        dbgid: u64,
        config: CommitProxyConfig,
        recovery_transaction_version: Version,
        master: Arc<dyn MasterClient>,
        resolvers: Vec<Arc<dyn ResolverClient>>,
        log_system: Arc<dyn LogSystem>,
        rate_keeper: Arc<dyn RateKeeperClient>,
    ) -> Arc<Self> {
        assert!(
            config.max_read_transaction_life_versions <= config.max_versions_in_flight,
            "read-life window must fit inside the in-flight version bound"
        );
        assert!(!resolvers.is_empty(), "a commit proxy needs at least one resolver");
        let state = CommitState::new(&config);
        Arc::new(Self {
            dbgid,
            config,
            master,
            resolvers,
            log_system,
            rate_keeper,
            committed_version: NotifiedVersion::new(recovery_transaction_version),
            latest_local_commit_batch_resolving: NotifiedVersion::new(0),
            latest_local_commit_batch_logging: NotifiedVersion::new(0),
            min_known_committed_version: AtomicI64::new(0),
            commit_batches_mem_bytes: Arc::new(AtomicI64::new(0)),
            local_commit_batches_started: AtomicI64::new(0),
            commit_version_request_number: AtomicU64::new(1),
            most_recent_processed_request_number: AtomicU64::new(0),
            valid_state: ValidState::new(),
            state: Mutex::new(state),
            stats: ProxyStats::default(),
        })
    }

    /// Lock the map-shaped state. Never hold the guard across an `await`.
    pub fn state(&self) -> std::sync::MutexGuard<'_, CommitState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn update_min_known_committed_version(&self, version: Version) {
        self.min_known_committed_version
            .fetch_max(version, Ordering::Relaxed);
    }

    /// Debug snapshot of the proxy's clocks and counters.
    pub fn status_json(&self) -> serde_json::Value {
        let state = self.state();
        serde_json::json!({
            "role": "commit_proxy",
            "dbgid": self.dbgid,
            "version": state.version,
            "committed_version": self.committed_version.get(),
            "min_known_committed_version": self.min_known_committed_version.load(Ordering::Relaxed),
            "locked": state.locked,
            "batches_started": self.local_commit_batches_started.load(Ordering::Relaxed),
            "batch_resolving": self.latest_local_commit_batch_resolving.get(),
            "batch_logging": self.latest_local_commit_batch_logging.get(),
            "commit_batch_interval_us": state.commit_batch_interval.as_micros() as u64,
            "mem_bytes": self.commit_batches_mem_bytes.load(Ordering::Relaxed),
            "key_resolver_ranges": state.key_resolvers.len(),
            "key_info_ranges": state.key_info.len(),
            "txn_commit_in": self.stats.txn_commit_in.load(Ordering::Relaxed),
            "txn_commit_out": self.stats.txn_commit_out.load(Ordering::Relaxed),
            "txn_commit_out_success": self.stats.txn_commit_out_success.load(Ordering::Relaxed),
            "txn_conflicts": self.stats.txn_conflicts.load(Ordering::Relaxed),
            "mutations": self.stats.mutations.load(Ordering::Relaxed),
        })
    }
}

/// Scoped reservation against the commit-batch memory counter.
///
/// Decrements on drop, so the counter releases on every exit path of a batch
/// including errors and cancellation.
#[derive(Debug)]
pub struct MemoryReservation {
    counter: Arc<AtomicI64>,
    bytes: i64,
}

impl MemoryReservation {
    pub fn acquire(counter: &Arc<AtomicI64>, bytes: i64) -> Self {
        counter.fetch_add(bytes, Ordering::Relaxed);
        Self {
            counter: counter.clone(),
            bytes,
        }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(self.bytes, Ordering::Relaxed);
        debug_assert!(previous >= self.bytes, "memory counter went negative");
    }
}
