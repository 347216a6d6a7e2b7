//! Runtime configuration for the two proxy roles.
//!
//! Defaults reflect production tuning; tests shrink the limits to force the
//! edge paths (memory pressure, tiny MVCC windows, instant throttles).

use std::time::Duration;

/// Tuning for the commit proxy.
#[derive(Clone, Debug)]
pub struct CommitProxyConfig {
    /// Floor of the adaptive batching interval.
    pub commit_batch_interval_min: Duration,
    /// Ceiling of the adaptive batching interval.
    pub commit_batch_interval_max: Duration,
    /// Interval used for the first request after an idle stretch.
    pub commit_batch_interval_from_idle: Duration,
    /// Fraction of observed end-to-end commit latency fed into the interval.
    pub commit_batch_interval_latency_fraction: f64,
    /// EMA weight of the latest latency observation.
    pub commit_batch_interval_smoother_alpha: f64,
    /// Hard cap on requests per batch.
    pub max_batch_count: usize,
    /// Byte size at which the batcher closes a batch early.
    pub desired_batch_bytes: usize,
    /// Upper bound for a single transaction's serialized size.
    pub transaction_size_limit: usize,
    /// Process-wide cap on bytes held by in-flight batches.
    pub commit_batches_mem_bytes_limit: i64,
    /// Size past which a single request logs a large-transaction diagnostic.
    pub large_transaction_warn_bytes: usize,
    /// An empty commit is started after this long without one, so versions
    /// keep advancing while idle.
    pub max_commit_batch_interval: Duration,

    /// MVCC window: maximum distance between an assigned commit version and
    /// the durably committed version before the pipeline blocks.
    pub max_read_transaction_life_versions: i64,
    /// Age (in versions) past which resolver-routing history is discarded.
    pub max_write_transaction_life_versions: i64,
    /// Sanity bound on versions in flight; must be ≥ the read-life window.
    pub max_versions_in_flight: i64,
    /// Poll spacing while waiting out the MVCC window.
    pub proxy_spin_delay: Duration,

    /// Bounded history of (commit version → txs pop-to) pairs.
    pub max_txs_pop_version_history: usize,
    /// Cadence of the resolver-map coalesce pass.
    pub resolver_coalesce_time: Duration,
    /// Cadence of remote-log queue polling for txs pops.
    pub update_remote_log_version_interval: Duration,
    /// Cadence of sampled commit-cost reports to the rate keeper.
    pub report_commit_cost_interval: Duration,

    /// Number of compute-latency buckets for the release delay estimate.
    pub proxy_compute_buckets: usize,
    /// Floor of the measured compute time that updates the estimate.
    pub min_proxy_compute: Duration,
    /// Cap on the computed release delay.
    pub max_proxy_compute: Duration,
    /// Growth weight when per-operation compute regresses.
    pub proxy_compute_growth_rate: f64,
    /// Byte budget between cooperative yields in the dispatch passes.
    pub desired_total_bytes: usize,

    /// Expected cost granularity of one write sample.
    pub commit_sample_cost: u64,
    /// Part size of serialized backup mutation blocks.
    pub mutation_block_size: usize,
    /// Versions per backup block-hash bucket.
    pub log_range_block_size: i64,

    /// Queue depth past which location requests are rejected.
    pub key_location_max_queue_size: usize,
}

impl Default for CommitProxyConfig {
    fn default() -> Self {
        Self {
            commit_batch_interval_min: Duration::from_millis(1),
            commit_batch_interval_max: Duration::from_millis(10),
            commit_batch_interval_from_idle: Duration::from_micros(500),
            commit_batch_interval_latency_fraction: 0.1,
            commit_batch_interval_smoother_alpha: 0.1,
            max_batch_count: 32_768,
            desired_batch_bytes: 512 * 1024,
            transaction_size_limit: 10_000_000,
            commit_batches_mem_bytes_limit: 8 << 30,
            large_transaction_warn_bytes: 1 << 20,
            max_commit_batch_interval: Duration::from_secs(2),
            max_read_transaction_life_versions: 5_000_000,
            max_write_transaction_life_versions: 5_000_000,
            max_versions_in_flight: 100_000_000,
            proxy_spin_delay: Duration::from_millis(10),
            max_txs_pop_version_history: 100_000,
            resolver_coalesce_time: Duration::from_secs(1),
            update_remote_log_version_interval: Duration::from_secs(2),
            report_commit_cost_interval: Duration::from_millis(100),
            proxy_compute_buckets: 20_000,
            min_proxy_compute: Duration::from_micros(500),
            max_proxy_compute: Duration::from_secs(2),
            proxy_compute_growth_rate: 0.01,
            desired_total_bytes: 150_000,
            commit_sample_cost: 100,
            mutation_block_size: 10_000,
            log_range_block_size: 1_000_000,
            key_location_max_queue_size: 30_000,
        }
    }
}

/// Tuning for the read-version proxy.
#[derive(Clone, Debug)]
pub struct GrvProxyConfig {
    /// Rolling window over which the admission limit is computed.
    pub rate_window: Duration,
    /// Budget carried forward when a priority's queue drains.
    pub max_empty_queue_budget: f64,
    /// Cap on transactions admitted per scheduler tick.
    pub max_transactions_to_start: i64,
    /// Cap on requests dequeued per scheduler tick.
    pub max_requests_to_start: usize,
    /// In-flight request count past which arrivals get the sentinel reply.
    pub max_queue_size: i64,

    /// Floor of the adaptive batch timer.
    pub batch_interval_min: Duration,
    /// Ceiling of the adaptive batch timer.
    pub batch_interval_max: Duration,
    /// Fraction of observed default-priority latency fed into the timer.
    pub batch_interval_latency_fraction: f64,
    /// EMA weight of the latest latency observation.
    pub batch_interval_smoother_alpha: f64,
    /// Re-check spacing while queues remain non-empty.
    pub batch_queue_check_interval: Duration,

    /// Causal-read guard: recovery must have been live this recently.
    pub required_min_recovery_duration: Duration,
    /// Floor on the spacing of epoch-live confirmations.
    pub min_confirm_interval: Duration,
    /// Cap on concurrent epoch-live confirmations.
    pub max_commit_updates: i64,
    /// When set, every request takes the risky path (skips confirmation).
    pub always_causal_read_risky: bool,

    /// Number of read-version proxies sharing the batch rate.
    pub grv_proxy_count: usize,
    /// Shard-size hint returned to clients for range splitting.
    pub mid_shard_size: i64,
    /// Detailed rate-keeper metrics are requested at most this often.
    pub detailed_metric_update_rate: Duration,
}

impl Default for GrvProxyConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(2),
            max_empty_queue_budget: 10.0,
            max_transactions_to_start: 100_000,
            max_requests_to_start: 10_000,
            max_queue_size: 1_000_000,
            batch_interval_min: Duration::from_micros(500),
            batch_interval_max: Duration::from_millis(10),
            batch_interval_latency_fraction: 0.5,
            batch_interval_smoother_alpha: 0.1,
            batch_queue_check_interval: Duration::from_millis(1),
            required_min_recovery_duration: Duration::from_millis(80),
            min_confirm_interval: Duration::from_millis(50),
            max_commit_updates: 2_000,
            always_causal_read_risky: false,
            grv_proxy_count: 1,
            mid_shard_size: 200_000,
            detailed_metric_update_rate: Duration::from_secs(5),
        }
    }
}

/// Client-side transaction limits.
#[derive(Clone, Debug)]
pub struct TransactionLimits {
    pub key_size_limit: usize,
    pub value_size_limit: usize,
    /// Default per-transaction size limit; the option accepts [32, 10_000_000].
    pub size_limit: usize,
    pub max_watches: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            key_size_limit: 10_000,
            value_size_limit: 100_000,
            size_limit: 10_000_000,
            max_watches: 10_000,
        }
    }
}
