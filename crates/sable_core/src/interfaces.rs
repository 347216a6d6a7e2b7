//! Collaborator contracts consumed by the proxies.
//!
//! The coordination core is transport-agnostic; concrete implementations can
//! use RPC, in-memory channels, or test harnesses. Every call returns
//! `anyhow::Result` — a severed collaborator surfaces as an error which the
//! commit path converts to `master_tlog_failed` per the failure policy.

use async_trait::async_trait;

use crate::messages::{
    GetCommitVersionReply, GetCommitVersionRequest, GetRateInfoReply, GetRateInfoRequest,
    GetRawCommittedVersionReply, LogPushRequest, LogQueuingMetrics,
    ReportRawCommittedVersionRequest, ResolveTransactionBatchReply,
    ResolveTransactionBatchRequest,
};
use crate::types::Version;
use bytes::Bytes;
use std::collections::HashMap;

/// The master: version oracle and cluster-wide committed-version registry.
#[async_trait]
pub trait MasterClient: Send + Sync + 'static {
    async fn get_commit_version(
        &self,
        req: GetCommitVersionRequest,
    ) -> anyhow::Result<GetCommitVersionReply>;

    async fn get_live_committed_version(&self) -> anyhow::Result<GetRawCommittedVersionReply>;

    async fn report_live_committed_version(
        &self,
        req: ReportRawCommittedVersionRequest,
    ) -> anyhow::Result<()>;

    /// Submit a coordinator change. Expected to fail: the cluster restarts
    /// the transaction subsystem instead of replying.
    async fn change_coordinators(&self, new_coordinators: Bytes) -> anyhow::Result<()>;
}

/// One shard of the conflict-detection service.
#[async_trait]
pub trait ResolverClient: Send + Sync + 'static {
    async fn resolve(
        &self,
        req: ResolveTransactionBatchRequest,
    ) -> anyhow::Result<ResolveTransactionBatchReply>;
}

/// The replicated log.
#[async_trait]
pub trait LogSystem: Send + Sync + 'static {
    /// Append one commit's messages; resolves to the logged version once the
    /// push is durable on a quorum.
    async fn push(&self, req: LogPushRequest) -> anyhow::Result<Version>;

    /// Pop the transaction-state stream up to `upto`. `locality` selects
    /// remote-DC logs; `None` pops the local txs stream.
    fn pop_txs(&self, upto: Version, locality: Option<i8>);

    /// Confirm the current log epoch is still live (causal-read guard).
    async fn confirm_epoch_live(&self) -> anyhow::Result<()>;

    /// True once remote-locality logs are recruited.
    fn has_remote_logs(&self) -> bool;

    /// Queue-depth metrics of each remote log.
    async fn remote_queuing_metrics(&self) -> anyhow::Result<Vec<LogQueuingMetrics>>;
}

/// The rate keeper: admission-rate advice and commit-cost intake.
#[async_trait]
pub trait RateKeeperClient: Send + Sync + 'static {
    async fn get_rate_info(&self, req: GetRateInfoRequest) -> anyhow::Result<GetRateInfoReply>;

    /// Forward sampled per-storage-server, per-tag commit costs.
    async fn report_commit_cost(
        &self,
        costs: HashMap<u64, HashMap<crate::types::TransactionTag, CommitCost>>,
    ) -> anyhow::Result<()>;
}

/// Aggregated sampled cost for one (storage server, tag) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitCost {
    pub ops_sum: u64,
    pub cost_sum: u64,
}
