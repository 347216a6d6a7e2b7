//! Commit proxy server core: wiring, seeding, and side monitors.
//!
//! The core spawns the batcher and feeds each emitted batch through the
//! five-phase pipeline, strictly in batch-number order. Around that it runs
//! the txn-state seeding protocol, the key-location service, the remote-log
//! pop monitor, and the commit-cost reporter. Terminal errors end the proxy
//! cleanly so the cluster can recruit a replacement; everything else
//! propagates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sable_core::messages::{
    CommitTransactionRequest, GetKeyServerLocationsReply, GetKeyServerLocationsRequest,
    TxnStateRequest,
};
use sable_core::types::{KeyRange, TAG_LOCALITY_REMOTE_LOG};
use sable_core::StoreError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::batcher::{commit_batcher, BatchedRequests};
use crate::commit_batch::commit_batch;
use crate::commit_data::CommitProxyData;
use crate::metadata;

/// Channel endpoints a commit proxy serves.
pub struct CommitProxyChannels {
    pub commits: mpsc::UnboundedReceiver<CommitTransactionRequest>,
    pub txn_state: mpsc::UnboundedReceiver<TxnStateRequest>,
    pub key_locations: mpsc::UnboundedReceiver<GetKeyServerLocationsRequest>,
}

/// Run the commit proxy until its commit stream closes or a terminal error
/// shuts it down.
pub async fn commit_proxy_server(
    data: Arc<CommitProxyData>,
    channels: CommitProxyChannels,
) -> anyhow::Result<()> {
    match commit_proxy_server_core(data.clone(), channels).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_proxy_fatal() => {
            tracing::info!(dbgid = data.dbgid, code = err.code(), error = %err, "commit proxy terminated");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn commit_proxy_server_core(
    data: Arc<CommitProxyData>,
    channels: CommitProxyChannels,
) -> Result<(), StoreError> {
    let (batched_tx, mut batched_rx) = mpsc::unbounded_channel::<BatchedRequests>();

    let mut tasks: JoinSet<Result<(), StoreError>> = JoinSet::new();
    tasks.spawn({
        let data = data.clone();
        let commits = channels.commits;
        async move {
            commit_batcher(data, commits, batched_tx).await;
            Ok(())
        }
    });
    tasks.spawn(txn_state_server(data.clone(), channels.txn_state));
    tasks.spawn(key_location_server(data.clone(), channels.key_locations));
    tasks.spawn(monitor_remote_committed(data.clone()));
    tasks.spawn(report_commit_costs(data.clone()));

    let in_flight_batches = Arc::new(AtomicUsize::new(0));
    // Allow an idle commit right away once the state is valid.
    let mut last_commit = Instant::now() - data.config.max_commit_batch_interval;

    loop {
        tokio::select! {
            batch = batched_rx.recv() => {
                let Some(batch) = batch else { break };
                let has_work = !batch.requests.is_empty();
                if !has_work
                    && (last_commit.elapsed() < data.config.max_commit_batch_interval
                        || in_flight_batches.load(Ordering::Relaxed) != 0)
                {
                    continue;
                }
                // Nothing commits until the txn-state store is seeded.
                data.valid_state.wait().await;
                last_commit = Instant::now();
                in_flight_batches.fetch_add(1, Ordering::Relaxed);
                let data = data.clone();
                let in_flight = in_flight_batches.clone();
                tasks.spawn(async move {
                    let result = commit_batch(data, batch).await;
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                    result
                });
            }
            finished = tasks.join_next() => {
                match finished {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(join_error)) => {
                        tracing::warn!(error = %join_error, "commit proxy task panicked");
                        return Err(StoreError::MasterTlogFailed);
                    }
                    None => {}
                }
            }
        }
    }

    // Drain remaining work so in-flight replies still go out.
    while let Some(finished) = tasks.join_next().await {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_error) => {
                tracing::warn!(error = %join_error, "commit proxy task panicked");
                return Err(StoreError::MasterTlogFailed);
            }
        }
    }
    Ok(())
}

/// Replay sequenced txn-state snapshot chunks, then build the derived maps.
async fn txn_state_server(
    data: Arc<CommitProxyData>,
    mut requests: mpsc::UnboundedReceiver<TxnStateRequest>,
) -> Result<(), StoreError> {
    let mut seen_sequences: HashSet<u64> = HashSet::new();
    let mut max_sequence = u64::MAX;
    while let Some(req) = requests.recv().await {
        if req.last {
            max_sequence = req.sequence + 1;
        }
        if seen_sequences.insert(req.sequence) {
            // Resolution results cannot arrive before the replay finishes,
            // so the store is still private to this task.
            debug_assert!(!data.valid_state.is_set());
            let mut state = data.state();
            for (key, value) in &req.data {
                state.txn_state_store.seed(key.clone(), value.clone());
            }
            if seen_sequences.len() as u64 == max_sequence {
                metadata::load_initial_state(&mut state);
                drop(state);
                data.valid_state.set();
                tracing::info!(dbgid = data.dbgid, "txn state store seeded");
            }
        }
        let _ = req.reply.send(Ok(()));
    }
    Ok(())
}

/// Serve shard-location queries from the key→info map, with queue-depth
/// admission control.
async fn key_location_server(
    data: Arc<CommitProxyData>,
    mut requests: mpsc::UnboundedReceiver<GetKeyServerLocationsRequest>,
) -> Result<(), StoreError> {
    while let Some(req) = requests.recv().await {
        let in_flight = data.stats.key_server_location_in.load(Ordering::Relaxed)
            - data.stats.key_server_location_out.load(Ordering::Relaxed);
        if in_flight > data.config.key_location_max_queue_size as u64 {
            data.stats
                .key_server_location_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!("key location queue threshold exceeded");
            let _ = req.reply.send(Err(StoreError::ProxyMemoryLimitExceeded));
            continue;
        }
        data.stats
            .key_server_location_in
            .fetch_add(1, Ordering::Relaxed);
        let data = data.clone();
        tokio::spawn(async move {
            data.valid_state.wait().await;
            let reply = key_locations(&data, &req);
            let _ = req.reply.send(Ok(reply));
            data.stats
                .key_server_location_out
                .fetch_add(1, Ordering::Relaxed);
        });
    }
    Ok(())
}

fn key_locations(
    data: &Arc<CommitProxyData>,
    req: &GetKeyServerLocationsRequest,
) -> GetKeyServerLocationsReply {
    let state = data.state();
    let mut results = Vec::new();
    match &req.end {
        None => {
            let (range, info) = if req.reverse {
                state.key_info.range_containing_key_before(&req.begin)
            } else {
                state.key_info.range_containing(&req.begin)
            };
            results.push((range, info.src.clone()));
        }
        Some(end) => {
            let query = KeyRange::new(req.begin.clone(), end.clone());
            let intersecting = state.key_info.intersecting(&query);
            if req.reverse {
                for (range, info) in intersecting.into_iter().rev().take(req.limit.max(1)) {
                    results.push((range, info.src.clone()));
                }
            } else {
                for (range, info) in intersecting.into_iter().take(req.limit.max(1)) {
                    results.push((range, info.src.clone()));
                }
            }
        }
    }
    GetKeyServerLocationsReply { results }
}

/// Poll remote-log queue depths and pop the txs stream on remote logs up to
/// the corresponding recorded pop-to values.
async fn monitor_remote_committed(data: Arc<CommitProxyData>) -> Result<(), StoreError> {
    if !data.log_system.has_remote_logs() {
        std::future::pending::<()>().await;
    }
    data.state().pop_remote_txs = true;
    loop {
        match data.log_system.remote_queuing_metrics().await {
            Ok(metrics) => {
                if let Some(min_version) = metrics.iter().map(|m| m.version).min() {
                    let pops: Vec<_> = {
                        let mut state = data.state();
                        let mut pops = Vec::new();
                        while state
                            .txs_pop_versions
                            .front()
                            .map(|(version, _)| *version <= min_version)
                            .unwrap_or(false)
                        {
                            let (_, pop_to) = state
                                .txs_pop_versions
                                .pop_front()
                                .unwrap_or((0, 0));
                            state.last_txs_pop = pop_to;
                            pops.push(pop_to);
                        }
                        pops
                    };
                    for pop_to in pops {
                        data.log_system
                            .pop_txs(pop_to, Some(TAG_LOCALITY_REMOTE_LOG));
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = ?err, "remote log metrics unavailable");
            }
        }
        sleep(data.config.update_remote_log_version_interval).await;
    }
}

/// Forward sampled per-storage-server commit costs to the rate keeper.
async fn report_commit_costs(data: Arc<CommitProxyData>) -> Result<(), StoreError> {
    loop {
        sleep(data.config.report_commit_cost_interval).await;
        let costs = std::mem::take(&mut data.state().ss_tag_commit_cost);
        if costs.is_empty() {
            continue;
        }
        if let Err(err) = data.rate_keeper.report_commit_cost(costs).await {
            tracing::debug!(error = ?err, "commit cost report failed");
        }
    }
}
