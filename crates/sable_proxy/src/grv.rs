//! Read-version proxy: priority queues, token-bucket admission, causal-read
//! confirmation, and per-tag throttles.
//!
//! Requests queue by priority and are drained by a timer-driven scheduler.
//! Admission at each tick is gated by two `RateInfo` instances fed by the
//! rate keeper: normal-priority work must fit both the normal and batch
//! budgets, batch work only the batch budget. Dequeued requests partition by
//! the causal-read-risky flag; the risky side skips the epoch-live
//! confirmation and instead requires a recent confirmed commit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sable_core::interfaces::{LogSystem, MasterClient, RateKeeperClient};
use sable_core::messages::{
    GetRateInfoRequest, GetReadVersionReply, GetReadVersionRequest, PrioritizedThrottles,
};
use sable_core::notified::NotifiedTime;
use sable_core::smoother::Smoother;
use sable_core::types::{Priority, TransactionTag, Version};
use sable_core::StoreError;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::GrvProxyConfig;
use crate::util::{jittered, now_seconds};

/// Admission state for one priority tier.
#[derive(Debug)]
pub struct RateInfo {
    pub rate: f64,
    pub limit: f64,
    pub budget: f64,
    pub disabled: bool,
    smooth_rate: Smoother,
    smooth_released: Smoother,
    window_seconds: f64,
}

impl RateInfo {
    pub fn new(rate: f64, window: Duration) -> Self {
        Self {
            rate,
            limit: 0.0,
            budget: 0.0,
            disabled: true,
            smooth_rate: Smoother::new(window.as_secs_f64()),
            smooth_released: Smoother::new(window.as_secs_f64()),
            window_seconds: window.as_secs_f64(),
        }
    }

    /// Recompute the windowed limit: the transactions we could have released
    /// over the window but did not. The limit can be negative when the
    /// budget (or higher-priority traffic) pushed us past the allowed rate.
    pub fn reset(&mut self) {
        let release_rate = self.smooth_rate.smooth_total() - self.smooth_released.smooth_rate();
        self.limit = self.window_seconds * release_rate;
    }

    pub fn can_start(&self, already_started: i64, count: i64, max_to_start: i64) -> bool {
        (already_started + count) as f64 <= (self.limit + self.budget).min(max_to_start as f64)
    }

    /// Accumulate unused capacity into the elastic budget.
    pub fn update_budget(
        &mut self,
        started_at_priority: i64,
        queue_empty: bool,
        elapsed_seconds: f64,
        max_empty_queue_budget: f64,
    ) {
        self.budget = (self.budget
            + elapsed_seconds * (self.limit - started_at_priority as f64) / self.window_seconds)
            .max(0.0);
        if queue_empty {
            // Carrying a big budget over an empty queue would blunt our
            // responsiveness to rate changes.
            self.budget = self.budget.min(max_empty_queue_budget);
        }
        self.smooth_released.add_delta(started_at_priority as f64);
    }

    pub fn disable(&mut self) {
        self.disabled = true;
        self.rate = 0.0;
        self.smooth_rate.reset(0.0);
    }

    pub fn set_rate(&mut self, rate: f64) {
        debug_assert!(rate.is_finite() && rate >= 0.0);
        self.rate = rate;
        if self.disabled {
            self.smooth_rate.reset(rate);
            self.disabled = false;
        } else {
            self.smooth_rate.set_total(rate);
        }
    }
}

/// Read-version proxy counters.
#[derive(Debug, Default)]
pub struct GrvProxyStats {
    pub txn_request_in: AtomicU64,
    pub txn_request_out: AtomicU64,
    pub txn_request_errors: AtomicU64,
    pub txn_start_in: AtomicU64,
    pub txn_start_out: AtomicU64,
    pub txn_system_priority_start_out: AtomicU64,
    pub txn_default_priority_start_out: AtomicU64,
    pub txn_batch_priority_start_out: AtomicU64,
    pub txn_throttled: AtomicU64,
    pub last_grv_latency_us: AtomicU64,
}

/// Queues, rates, and throttles; guarded by one mutex, never held across an
/// `await`.
pub struct GrvShared {
    pub system_queue: VecDeque<GetReadVersionRequest>,
    pub default_queue: VecDeque<GetReadVersionRequest>,
    pub batch_queue: VecDeque<GetReadVersionRequest>,
    pub transaction_tag_counter: HashMap<TransactionTag, u64>,
    pub throttled_tags: PrioritizedThrottles,
    pub normal_rate_info: RateInfo,
    pub batch_rate_info: RateInfo,
    pub grv_batch_time: Duration,
    pub last_grv_time: f64,
    pub total_transaction_count: i64,
    pub batch_transaction_count: i64,
}

impl GrvShared {
    fn queues_empty(&self) -> bool {
        self.system_queue.is_empty() && self.default_queue.is_empty() && self.batch_queue.is_empty()
    }
}

/// Everything one read-version proxy owns.
pub struct GrvProxyData {
    pub dbgid: u64,
    pub config: GrvProxyConfig,
    pub master: Arc<dyn MasterClient>,
    pub log_system: Arc<dyn LogSystem>,
    pub rate_keeper: Arc<dyn RateKeeperClient>,
    pub stats: GrvProxyStats,
    pub min_known_committed_version: AtomicI64,
    pub update_commit_requests: AtomicI64,
    /// Start time (process seconds) of the most recent epoch confirmation.
    pub last_start_commit: Mutex<f64>,
    /// Latency of the most recent epoch confirmation, seconds.
    pub last_commit_latency: Mutex<f64>,
    /// Most recent time at which a confirmation round started.
    pub last_commit_time: NotifiedTime,
    pub shared: Mutex<GrvShared>,
}

impl GrvProxyData {
    pub fn new(
        dbgid: u64,
        config: GrvProxyConfig,
        master: Arc<dyn MasterClient>,
        log_system: Arc<dyn LogSystem>,
        rate_keeper: Arc<dyn RateKeeperClient>,
    ) -> Arc<Self> {
        let shared = GrvShared {
            system_queue: VecDeque::new(),
            default_queue: VecDeque::new(),
            batch_queue: VecDeque::new(),
            transaction_tag_counter: HashMap::new(),
            throttled_tags: PrioritizedThrottles::new(),
            normal_rate_info: RateInfo::new(10.0, config.rate_window),
            batch_rate_info: RateInfo::new(0.0, config.rate_window),
            grv_batch_time: config.batch_interval_min,
            last_grv_time: 0.0,
            total_transaction_count: 0,
            batch_transaction_count: 0,
        };
        Arc::new(Self {
            dbgid,
            config: config.clone(),
            master,
            log_system,
            rate_keeper,
            stats: GrvProxyStats::default(),
            min_known_committed_version: AtomicI64::new(0),
            update_commit_requests: AtomicI64::new(0),
            last_start_commit: Mutex::new(0.0),
            last_commit_latency: Mutex::new(
                config.required_min_recovery_duration.as_secs_f64(),
            ),
            last_commit_time: NotifiedTime::new(0.0),
            shared: Mutex::new(shared),
        })
    }

    pub fn shared(&self) -> std::sync::MutexGuard<'_, GrvShared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn in_flight_requests(&self) -> i64 {
        self.stats.txn_request_in.load(Ordering::Relaxed) as i64
            - self.stats.txn_request_out.load(Ordering::Relaxed) as i64
    }

    /// Debug snapshot of the proxy's queues and rates.
    pub fn status_json(&self) -> serde_json::Value {
        let shared = self.shared();
        serde_json::json!({
            "role": "grv_proxy",
            "dbgid": self.dbgid,
            "system_queue": shared.system_queue.len(),
            "default_queue": shared.default_queue.len(),
            "batch_queue": shared.batch_queue.len(),
            "normal_rate": shared.normal_rate_info.rate,
            "batch_rate": shared.batch_rate_info.rate,
            "normal_budget": shared.normal_rate_info.budget,
            "batch_budget": shared.batch_rate_info.budget,
            "grv_batch_time_us": shared.grv_batch_time.as_micros() as u64,
            "txn_request_in": self.stats.txn_request_in.load(Ordering::Relaxed),
            "txn_request_out": self.stats.txn_request_out.load(Ordering::Relaxed),
            "txn_start_out": self.stats.txn_start_out.load(Ordering::Relaxed),
            "txn_throttled": self.stats.txn_throttled.load(Ordering::Relaxed),
            "min_known_committed_version": self.min_known_committed_version.load(Ordering::Relaxed),
        })
    }
}

/// Run the read-version proxy until the request stream closes.
pub async fn grv_proxy_server(
    data: Arc<GrvProxyData>,
    requests: mpsc::UnboundedReceiver<GetReadVersionRequest>,
) -> anyhow::Result<()> {
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(get_rate_loop(data.clone()));
    tasks.spawn(last_commit_updater(data.clone()));
    tasks.spawn(transaction_starter(data.clone(), tick_rx, tick_tx.clone()));
    tasks.spawn(queue_read_version_requests(data.clone(), requests, tick_tx));

    // The first task to finish decides the outcome: ingestion ends cleanly
    // when the stream closes, anything else is a proxy failure.
    let result = tasks.join_next().await;
    tasks.abort_all();
    match result {
        Some(Ok(result)) => result,
        Some(Err(join_error)) => Err(anyhow::anyhow!("grv proxy task panicked: {join_error}")),
        None => Ok(()),
    }
}

/// Ingest requests into the priority queues.
async fn queue_read_version_requests(
    data: Arc<GrvProxyData>,
    mut requests: mpsc::UnboundedReceiver<GetReadVersionRequest>,
    tick_tx: mpsc::UnboundedSender<()>,
) -> anyhow::Result<()> {
    while let Some(req) = requests.recv().await {
        if data.in_flight_requests() > data.config.max_queue_size {
            data.stats.txn_request_errors.fetch_add(1, Ordering::Relaxed);
            data.stats.txn_request_in.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("read-version queue threshold exceeded");
            // For client compatibility this is an unreadable sentinel reply,
            // not an error.
            let _ = req.reply.send(Ok(GetReadVersionReply {
                version: 1,
                locked: true,
                metadata_version: None,
                process_busy_time: 0,
                mid_shard_size: 0,
                tag_throttle_info: HashMap::new(),
            }));
            data.stats.txn_request_out.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mut shared = data.shared();
        for (tag, count) in &req.tags {
            *shared
                .transaction_tag_counter
                .entry(tag.clone())
                .or_insert(0) += (*count).max(0) as u64;
        }

        if shared.queues_empty() {
            let wait = (shared.grv_batch_time.as_secs_f64()
                - (now_seconds() - shared.last_grv_time))
                .max(0.0);
            let tick_tx = tick_tx.clone();
            tokio::spawn(async move {
                sleep(jittered(Duration::from_secs_f64(wait))).await;
                let _ = tick_tx.send(());
            });
        }

        data.stats.txn_request_in.fetch_add(1, Ordering::Relaxed);
        data.stats
            .txn_start_in
            .fetch_add(req.transaction_count.max(0) as u64, Ordering::Relaxed);
        match req.priority {
            Priority::Immediate => shared.system_queue.push_back(req),
            Priority::Default => shared.default_queue.push_back(req),
            Priority::Batch => {
                // Batch work is rejected outright when this proxy's share of
                // the batch rate has collapsed.
                let proxies = data.config.grv_proxy_count.max(1);
                if shared.batch_rate_info.rate <= 1.0 / proxies as f64 {
                    data.stats
                        .txn_throttled
                        .fetch_add(req.transaction_count.max(0) as u64, Ordering::Relaxed);
                    data.stats.txn_request_out.fetch_add(1, Ordering::Relaxed);
                    let _ = req.reply.send(Err(StoreError::BatchTransactionThrottled));
                    continue;
                }
                shared.batch_queue.push_back(req);
            }
        }
    }
    Ok(())
}

/// Timer-driven scheduler: admit work and fan out version requests.
async fn transaction_starter(
    data: Arc<GrvProxyData>,
    mut ticks: mpsc::UnboundedReceiver<()>,
    tick_tx: mpsc::UnboundedSender<()>,
) -> anyhow::Result<()> {
    loop {
        if ticks.recv().await.is_none() {
            return Ok(());
        }

        // start[0]: requests confirming the epoch, start[1]: causal-read-risky.
        let mut start: [Vec<GetReadVersionRequest>; 2] = [Vec::new(), Vec::new()];
        let mut transactions_started = [0i64; 2];
        let mut system_started = [0i64; 2];
        let mut default_started = [0i64; 2];
        let mut batch_started = [0i64; 2];

        {
            let mut shared = data.shared();
            let now = now_seconds();
            let mut elapsed = now - shared.last_grv_time;
            shared.last_grv_time = now;
            if elapsed == 0.0 {
                // Resolve an indeterminate multiplication with an unbounded rate.
                elapsed = 1e-15;
            }

            shared.normal_rate_info.reset();
            shared.batch_rate_info.reset();

            let mut requests_to_start = 0usize;
            while requests_to_start < data.config.max_requests_to_start {
                let queue = if !shared.system_queue.is_empty() {
                    &mut shared.system_queue
                } else if !shared.default_queue.is_empty() {
                    &mut shared.default_queue
                } else if !shared.batch_queue.is_empty() {
                    &mut shared.batch_queue
                } else {
                    break;
                };
                let (priority, count) = {
                    let front = match queue.front() {
                        Some(front) => front,
                        None => break,
                    };
                    (front.priority, front.transaction_count)
                };
                let started_total = transactions_started[0] + transactions_started[1];
                let max_to_start = data.config.max_transactions_to_start;
                // Batch work draws on the batch budget alone; normal work
                // must fit both the normal budget and the total (batch) one.
                if priority < Priority::Default {
                    if !shared
                        .batch_rate_info
                        .can_start(started_total, count, max_to_start)
                    {
                        break;
                    }
                } else if priority < Priority::Immediate
                    && !(shared
                        .normal_rate_info
                        .can_start(started_total, count, max_to_start)
                        && shared
                            .batch_rate_info
                            .can_start(started_total, count, max_to_start))
                {
                    break;
                }

                let queue = if !shared.system_queue.is_empty() {
                    &mut shared.system_queue
                } else if !shared.default_queue.is_empty() {
                    &mut shared.default_queue
                } else {
                    &mut shared.batch_queue
                };
                let Some(req) = queue.pop_front() else { break };
                let risky = usize::from(req.causal_read_risky());
                transactions_started[risky] += count;
                match priority {
                    Priority::Immediate => system_started[risky] += count,
                    Priority::Default => default_started[risky] += count,
                    Priority::Batch => batch_started[risky] += count,
                }
                start[risky].push(req);
                requests_to_start += 1;
            }

            if !shared.queues_empty() {
                let tick_tx = tick_tx.clone();
                let check = data.config.batch_queue_check_interval;
                tokio::spawn(async move {
                    sleep(jittered(check)).await;
                    let _ = tick_tx.send(());
                });
            }

            let normal_total = system_started[0]
                + system_started[1]
                + default_started[0]
                + default_started[1];
            let batch_total = batch_started[0] + batch_started[1];
            shared.total_transaction_count += transactions_started[0] + transactions_started[1];
            shared.batch_transaction_count += batch_total;

            let normal_queues_empty =
                shared.system_queue.is_empty() && shared.default_queue.is_empty();
            let all_queues_empty = normal_queues_empty && shared.batch_queue.is_empty();
            let max_empty = data.config.max_empty_queue_budget;
            shared
                .normal_rate_info
                .update_budget(normal_total, normal_queues_empty, elapsed, max_empty);
            shared.batch_rate_info.update_budget(
                normal_total + batch_total,
                all_queues_empty,
                elapsed,
                max_empty,
            );
        }

        for (risky, requests) in start.into_iter().enumerate() {
            if requests.is_empty() {
                continue;
            }
            let counts = PartitionCounts {
                transactions: transactions_started[risky],
                system: system_started[risky],
                default: default_started[risky],
                batch: batch_started[risky],
            };
            tokio::spawn(dispatch_partition(
                data.clone(),
                requests,
                risky == 1,
                counts,
                risky == 0,
            ));
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PartitionCounts {
    transactions: i64,
    system: i64,
    default: i64,
    batch: i64,
}

/// Fetch a live committed version for one partition and fan out replies.
async fn dispatch_partition(
    data: Arc<GrvProxyData>,
    requests: Vec<GetReadVersionRequest>,
    causal_read_risky: bool,
    counts: PartitionCounts,
    feed_latency: bool,
) {
    let started = Instant::now();
    match get_live_committed_version(&data, causal_read_risky).await {
        Ok(reply) => {
            data.stats
                .txn_start_out
                .fetch_add(counts.transactions.max(0) as u64, Ordering::Relaxed);
            data.stats
                .txn_system_priority_start_out
                .fetch_add(counts.system.max(0) as u64, Ordering::Relaxed);
            data.stats
                .txn_default_priority_start_out
                .fetch_add(counts.default.max(0) as u64, Ordering::Relaxed);
            data.stats
                .txn_batch_priority_start_out
                .fetch_add(counts.batch.max(0) as u64, Ordering::Relaxed);

            let latency = started.elapsed();
            if feed_latency {
                // Dynamic batching keys off normal-priority reply latency.
                let config = &data.config;
                let target =
                    latency.as_secs_f64() * config.batch_interval_latency_fraction;
                let alpha = config.batch_interval_smoother_alpha;
                let mut shared = data.shared();
                let smoothed =
                    target * alpha + shared.grv_batch_time.as_secs_f64() * (1.0 - alpha);
                shared.grv_batch_time = Duration::from_secs_f64(smoothed.clamp(
                    config.batch_interval_min.as_secs_f64(),
                    config.batch_interval_max.as_secs_f64(),
                ));
            }
            data.stats
                .last_grv_latency_us
                .store(latency.as_micros() as u64, Ordering::Relaxed);

            send_grv_replies(&data, requests, reply);
        }
        Err(err) => {
            tracing::warn!(error = ?err, "live committed version fetch failed");
            for req in requests {
                let _ = req.reply.send(Err(StoreError::MasterTlogFailed));
                data.stats.txn_request_out.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A committed version that is safe to read at: confirmed against the log
/// epoch unless the caller accepted causal-read risk.
async fn get_live_committed_version(
    data: &Arc<GrvProxyData>,
    causal_read_risky: bool,
) -> anyhow::Result<GetReadVersionReply> {
    let config = &data.config;
    let master_reply = if !config.always_causal_read_risky && !causal_read_risky {
        let (reply, confirmed) = tokio::join!(
            data.master.get_live_committed_version(),
            update_last_commit(data.clone())
        );
        confirmed?;
        reply?
    } else {
        if config.required_min_recovery_duration > Duration::ZERO {
            let floor = now_seconds() - config.required_min_recovery_duration.as_secs_f64();
            data.last_commit_time.when_at_least(floor).await;
        }
        data.master.get_live_committed_version().await?
    };

    data.min_known_committed_version
        .fetch_max(master_reply.min_known_committed_version, Ordering::Relaxed);

    Ok(GetReadVersionReply {
        version: master_reply.version,
        locked: master_reply.locked,
        metadata_version: master_reply.metadata_version,
        process_busy_time: 0,
        mid_shard_size: config.mid_shard_size,
        tag_throttle_info: HashMap::new(),
    })
}

/// Confirm the log epoch is live, updating the confirmation clocks.
async fn update_last_commit(data: Arc<GrvProxyData>) -> anyhow::Result<()> {
    let confirm_start = now_seconds();
    *data
        .last_start_commit
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = confirm_start;
    data.update_commit_requests.fetch_add(1, Ordering::Relaxed);
    let result = data.log_system.confirm_epoch_live().await;
    data.update_commit_requests.fetch_sub(1, Ordering::Relaxed);
    result?;
    *data
        .last_commit_latency
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = now_seconds() - confirm_start;
    data.last_commit_time.set_max(confirm_start);
    Ok(())
}

/// Keep the confirmation clock fresh even without client traffic.
async fn last_commit_updater(data: Arc<GrvProxyData>) -> anyhow::Result<()> {
    loop {
        let config = &data.config;
        let latency = *data
            .last_commit_latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let interval = config
            .min_confirm_interval
            .as_secs_f64()
            .max((config.required_min_recovery_duration.as_secs_f64() - latency) / 2.0);
        let elapsed = now_seconds()
            - *data
                .last_start_commit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        if elapsed < interval {
            sleep(Duration::from_secs_f64(interval - elapsed + 0.0001)).await;
        } else if data.update_commit_requests.load(Ordering::Relaxed) < config.max_commit_updates {
            // Claim the slot before the task is scheduled so this loop does
            // not spawn again for the same window.
            *data
                .last_start_commit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = now_seconds();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(err) = update_last_commit(data).await {
                    tracing::debug!(error = ?err, "epoch confirmation failed");
                }
            });
        } else {
            tracing::warn!("too many outstanding epoch confirmations");
            *data
                .last_start_commit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = now_seconds();
        }
    }
}

/// Send one partition's replies, substituting versions and attaching the
/// intersection of each request's tags with the live throttle map.
fn send_grv_replies(
    data: &Arc<GrvProxyData>,
    requests: Vec<GetReadVersionRequest>,
    base_reply: GetReadVersionReply,
) {
    let min_known: Version = data.min_known_committed_version.load(Ordering::Relaxed);
    let mut shared = data.shared();
    for req in requests {
        let mut reply = base_reply.clone();
        if req.use_min_known_committed_version() {
            // Only backup workers use this flag, and infrequently.
            reply.version = min_known;
        }
        reply.tag_throttle_info.clear();
        if !req.tags.is_empty() {
            let priority_throttles = shared.throttled_tags.entry(req.priority).or_default();
            for (tag, _) in &req.tags {
                if let Some(info) = priority_throttles.get(tag).copied() {
                    if info.expiration > Instant::now() {
                        // An unlimited rate means the tag is not throttled.
                        if info.tps_rate < f64::MAX {
                            reply.tag_throttle_info.insert(tag.clone(), info);
                        }
                    } else {
                        // Expired entries are purged lazily.
                        priority_throttles.remove(tag);
                    }
                }
            }
        }
        let _ = req.reply.send(Ok(reply));
        data.stats.txn_request_out.fetch_add(1, Ordering::Relaxed);
    }
}

/// Rate-keeper lease loop: renew at half-lease, disable on expiry, replace
/// the throttle map atomically when the keeper sends one.
async fn get_rate_loop(data: Arc<GrvProxyData>) -> anyhow::Result<()> {
    let mut lease_deadline: Option<Instant> = None;
    let mut last_detailed: Option<Instant> = None;
    loop {
        let request = {
            let mut shared = data.shared();
            let detailed = last_detailed
                .map(|at| at.elapsed() > data.config.detailed_metric_update_rate)
                .unwrap_or(true);
            GetRateInfoRequest {
                requester_id: data.dbgid,
                total_released_transactions: shared.total_transaction_count,
                batch_released_transactions: shared.batch_transaction_count,
                tag_counts: std::mem::take(&mut shared.transaction_tag_counter),
                detailed,
            }
        };
        let detailed = request.detailed;

        let lease_expiry = async {
            match lease_deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            reply = data.rate_keeper.get_rate_info(request) => match reply {
                Ok(reply) => {
                    {
                        let mut shared = data.shared();
                        shared.normal_rate_info.set_rate(reply.transaction_rate);
                        shared.batch_rate_info.set_rate(reply.batch_transaction_rate);
                        if let Some(throttles) = reply.throttled_tags {
                            // Wholesale replacement; nothing to expire here.
                            shared.throttled_tags = throttles;
                        }
                    }
                    if detailed {
                        last_detailed = Some(Instant::now());
                    }
                    lease_deadline = Some(Instant::now() + reply.lease_duration);
                    sleep(jittered(reply.lease_duration / 2)).await;
                }
                Err(err) => {
                    tracing::debug!(error = ?err, "rate keeper request failed");
                    sleep(Duration::from_secs(1)).await;
                }
            },
            _ = lease_expiry => {
                let mut shared = data.shared();
                shared.normal_rate_info.disable();
                shared.batch_rate_info.disable();
                drop(shared);
                tracing::warn!("rate keeper lease expired");
                lease_deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_accumulates_and_caps_on_empty_queue() {
        let mut info = RateInfo::new(0.0, Duration::from_secs(2));
        info.set_rate(100.0);
        info.limit = 50.0;
        // Started nothing for one second: budget grows by limit/window × t.
        info.update_budget(0, false, 1.0, 10.0);
        assert!(info.budget > 0.0);
        let grown = info.budget;
        // Draining the queue caps the carried budget.
        info.update_budget(0, true, 1.0, 10.0);
        assert!(info.budget <= 10.0, "budget {} (was {grown})", info.budget);
    }

    #[test]
    fn budget_never_goes_negative() {
        let mut info = RateInfo::new(0.0, Duration::from_secs(2));
        info.set_rate(1.0);
        info.limit = 1.0;
        info.update_budget(1_000, false, 1.0, 10.0);
        assert_eq!(info.budget, 0.0);
    }

    #[test]
    fn can_start_respects_limit_budget_and_cap() {
        let mut info = RateInfo::new(0.0, Duration::from_secs(2));
        info.set_rate(10.0);
        info.limit = 5.0;
        info.budget = 2.0;
        assert!(info.can_start(0, 7, 1_000));
        assert!(!info.can_start(0, 8, 1_000));
        assert!(!info.can_start(7, 1, 1_000));
        // The hard cap binds even with a huge budget.
        info.budget = 1e9;
        assert!(!info.can_start(0, 11, 10));
    }

    #[test]
    fn disable_zeroes_the_rate() {
        let mut info = RateInfo::new(5.0, Duration::from_secs(2));
        info.set_rate(5.0);
        assert!(!info.disabled);
        info.disable();
        assert!(info.disabled);
        assert_eq!(info.rate, 0.0);
        info.reset();
        assert!(info.limit <= 0.0 + 1e-9);
    }
}
