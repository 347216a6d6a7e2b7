//! Commit batcher: turns the stream of commit requests into batches.
//!
//! A batch closes when the adaptive interval timer fires, when admitting the
//! next request would cross the transaction size limit, when the request
//! count hits the cap, or when a request carries the first-in-batch flag.
//! Admission is gated by the process-wide commit-batch memory counter; the
//! reservation for each admitted request is released after its batch's reply
//! phase.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use sable_core::messages::CommitTransactionRequest;
use sable_core::StoreError;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::commit_data::{CommitProxyData, MemoryReservation};
use crate::util::jittered;

/// One batch handed to the commit pipeline: the requests, their total bytes,
/// and the memory reservations backing them.
pub struct BatchedRequests {
    pub requests: Vec<CommitTransactionRequest>,
    pub bytes: usize,
    pub reservations: Vec<MemoryReservation>,
}

/// Run the batcher until the inbound stream closes.
pub async fn commit_batcher(
    data: Arc<CommitProxyData>,
    mut inbound: mpsc::UnboundedReceiver<CommitTransactionRequest>,
    outbound: mpsc::UnboundedSender<BatchedRequests>,
) {
    let config = data.config.clone();
    let initial_interval = data.state().commit_batch_interval;
    sleep(jittered(initial_interval)).await;

    let mut last_batch: Option<Instant> = None;
    'batches: loop {
        let mut batch: Vec<CommitTransactionRequest> = Vec::new();
        let mut reservations: Vec<MemoryReservation> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut timeout = Box::pin(sleep(jittered(config.max_commit_batch_interval)));

        while batch.len() < config.max_batch_count && batch_bytes < config.desired_batch_bytes {
            tokio::select! {
                _ = &mut timeout => break,
                req = inbound.recv() => {
                    let Some(req) = req else {
                        // Stream closed: flush what we have and stop.
                        if !batch.is_empty() {
                            let _ = outbound.send(BatchedRequests { requests: batch, bytes: batch_bytes, reservations });
                        }
                        break 'batches;
                    };
                    let bytes = req.transaction.expected_size();

                    // Drop requests while memory is under severe pressure.
                    let in_flight = data.commit_batches_mem_bytes.load(Ordering::Relaxed);
                    if in_flight + bytes as i64 > config.commit_batches_mem_bytes_limit {
                        data.stats.txn_commit_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            mem_bytes = in_flight,
                            limit = config.commit_batches_mem_bytes_limit,
                            "commit batch memory threshold exceeded"
                        );
                        let _ = req.reply.send(Err(StoreError::ProxyMemoryLimitExceeded));
                        continue;
                    }

                    if bytes > config.large_transaction_warn_bytes {
                        tracing::warn!(size = bytes, debug_id = ?req.debug_id, "large transaction");
                    }
                    data.stats.txn_commit_in.fetch_add(1, Ordering::Relaxed);

                    if batch.is_empty() {
                        // First request of the window decides how long we wait
                        // for company.
                        let interval = data.state().commit_batch_interval;
                        let wait = match last_batch {
                            Some(at) if at.elapsed() < interval => interval - at.elapsed(),
                            Some(_) => config.commit_batch_interval_from_idle,
                            None => config.commit_batch_interval_from_idle,
                        };
                        timeout = Box::pin(sleep(jittered(wait)));
                    }

                    if !batch.is_empty()
                        && (batch_bytes + bytes > config.transaction_size_limit || req.first_in_batch())
                    {
                        let full = BatchedRequests {
                            requests: std::mem::take(&mut batch),
                            bytes: batch_bytes,
                            reservations: std::mem::take(&mut reservations),
                        };
                        if outbound.send(full).is_err() {
                            break 'batches;
                        }
                        last_batch = Some(Instant::now());
                        batch_bytes = 0;
                        let interval = data.state().commit_batch_interval;
                        timeout = Box::pin(sleep(jittered(interval)));
                    }

                    reservations.push(MemoryReservation::acquire(
                        &data.commit_batches_mem_bytes,
                        bytes as i64,
                    ));
                    batch.push(req);
                    batch_bytes += bytes;
                }
            }
        }

        // Timer fired or the batch filled; emit it even when empty so the
        // server core can keep versions advancing while idle.
        let out = BatchedRequests {
            requests: batch,
            bytes: batch_bytes,
            reservations,
        };
        if outbound.send(out).is_err() {
            break;
        }
        last_batch = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitProxyConfig;
    use crate::sim::sim_collaborators;
    use sable_core::messages::{CommitTransaction, COMMIT_FLAG_FIRST_IN_BATCH};
    use sable_core::mutation::Mutation;
    use tokio::sync::oneshot;

    fn request(bytes_hint: usize, flags: u8) -> (CommitTransactionRequest, oneshot::Receiver<Result<sable_core::messages::CommitId, StoreError>>) {
        let (tx, rx) = oneshot::channel();
        let value = vec![0u8; bytes_hint];
        let req = CommitTransactionRequest {
            transaction: CommitTransaction {
                read_snapshot: 0,
                mutations: vec![Mutation::set(&b"k"[..], value)],
                read_conflict_ranges: Vec::new(),
                write_conflict_ranges: Vec::new(),
                report_conflicting_keys: false,
            },
            flags,
            tags: Vec::new(),
            commit_cost_estimation: None,
            debug_id: None,
            span: tracing::Span::none(),
            reply: tx,
        };
        (req, rx)
    }

    fn test_data(config: CommitProxyConfig) -> Arc<CommitProxyData> {
        let (master, resolvers, log, rate_keeper, _storage) = sim_collaborators(1, 0);
        CommitProxyData::new(1, config, 0, master, resolvers, log, rate_keeper)
    }

    #[tokio::test]
    async fn first_in_batch_flag_splits_batches() {
        let data = test_data(CommitProxyConfig::default());
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(commit_batcher(data, in_rx, out_tx));

        let (a, _a_rx) = request(10, 0);
        let (b, _b_rx) = request(10, 0);
        let (c, _c_rx) = request(10, COMMIT_FLAG_FIRST_IN_BATCH);
        in_tx.send(a).unwrap();
        in_tx.send(b).unwrap();
        in_tx.send(c).unwrap();

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.requests.len(), 2);
        let second = out_rx.recv().await.unwrap();
        assert_eq!(second.requests.len(), 1);
        assert!(second.requests[0].first_in_batch());
    }

    #[tokio::test]
    async fn memory_pressure_rejects_requests() {
        let config = CommitProxyConfig {
            commit_batches_mem_bytes_limit: 64,
            ..CommitProxyConfig::default()
        };
        let data = test_data(config);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        tokio::spawn(commit_batcher(data, in_rx, out_tx));

        let (big, big_rx) = request(1024, 0);
        in_tx.send(big).unwrap();
        let result = big_rx.await.unwrap();
        assert_eq!(result, Err(StoreError::ProxyMemoryLimitExceeded));
    }
}
