//! Logical wire shapes exchanged between clients, proxies, and collaborators.
//!
//! Framing is a transport concern; these are the plain structs the proxies
//! operate on. Reply channels are `oneshot` senders carrying a typed result,
//! so per-transaction errors are delivered without aborting a batch.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::mutation::Mutation;
use crate::types::{KeyRange, Priority, Tag, TransactionTag, Version, TXS_TAG};

/// Reply channel carrying either a reply or a typed error.
pub type ReplyTx<T> = oneshot::Sender<Result<T, StoreError>>;

/// The conflict-checked body of a commit request.
#[derive(Clone, Debug, Default)]
pub struct CommitTransaction {
    pub read_snapshot: Version,
    pub mutations: Vec<Mutation>,
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub report_conflicting_keys: bool,
}

impl CommitTransaction {
    pub fn expected_size(&self) -> usize {
        let mutations: usize = self.mutations.iter().map(Mutation::expected_size).sum();
        let ranges: usize = self
            .read_conflict_ranges
            .iter()
            .chain(self.write_conflict_ranges.iter())
            .map(|r| r.begin.len() + r.end.len())
            .sum();
        mutations + ranges
    }
}

/// Client-supplied estimate of the write cost of a commit, used for
/// probabilistic tag-cost sampling.
#[derive(Clone, Debug, Default)]
pub struct CommitCostEstimation {
    pub write_costs: u64,
    /// `(mutation index, cost)` for expensive clear-ranges, in mutation order.
    pub clear_idx_costs: VecDeque<(usize, u64)>,
    pub expensive_cost_est_count: u64,
}

/// Commit request flags.
pub const COMMIT_FLAG_LOCK_AWARE: u8 = 0x01;
pub const COMMIT_FLAG_FIRST_IN_BATCH: u8 = 0x02;

/// A client transaction submitted for commit.
#[derive(Debug)]
pub struct CommitTransactionRequest {
    pub transaction: CommitTransaction,
    pub flags: u8,
    pub tags: Vec<TransactionTag>,
    pub commit_cost_estimation: Option<CommitCostEstimation>,
    pub debug_id: Option<u64>,
    pub span: tracing::Span,
    pub reply: ReplyTx<CommitId>,
}

impl CommitTransactionRequest {
    pub fn is_lock_aware(&self) -> bool {
        self.flags & COMMIT_FLAG_LOCK_AWARE != 0
    }

    pub fn first_in_batch(&self) -> bool {
        self.flags & COMMIT_FLAG_FIRST_IN_BATCH != 0
    }
}

/// Successful (or conflict-reporting) commit outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitId {
    pub version: Version,
    pub batch_index: u16,
    pub metadata_version: Option<Bytes>,
    /// When conflict-key reporting was requested and the commit lost, the
    /// client-visible indices of the read-conflict ranges that conflicted.
    pub conflicting_range_indices: Option<Vec<usize>>,
}

/// Read-version request flags (a bitset on the wire).
pub const GRV_FLAG_CAUSAL_READ_RISKY: u32 = 0x1;
pub const GRV_FLAG_USE_MIN_KNOWN_COMMITTED_VERSION: u32 = 0x4;

/// Request for a causally consistent read version.
#[derive(Debug)]
pub struct GetReadVersionRequest {
    pub priority: Priority,
    pub flags: u32,
    pub transaction_count: i64,
    pub tags: Vec<(TransactionTag, i64)>,
    pub debug_id: Option<u64>,
    pub span: tracing::Span,
    pub reply: ReplyTx<GetReadVersionReply>,
}

impl GetReadVersionRequest {
    pub fn causal_read_risky(&self) -> bool {
        self.flags & GRV_FLAG_CAUSAL_READ_RISKY != 0
    }

    pub fn use_min_known_committed_version(&self) -> bool {
        self.flags & GRV_FLAG_USE_MIN_KNOWN_COMMITTED_VERSION != 0
    }
}

/// Per-tag throttle advice attached to read-version replies.
#[derive(Clone, Copy, Debug)]
pub struct TagThrottleInfo {
    pub tps_rate: f64,
    pub expiration: Instant,
}

#[derive(Clone, Debug)]
pub struct GetReadVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Bytes>,
    pub process_busy_time: i64,
    pub mid_shard_size: i64,
    pub tag_throttle_info: HashMap<TransactionTag, TagThrottleInfo>,
}

/// Master: commit-version assignment.
#[derive(Clone, Debug)]
pub struct GetCommitVersionRequest {
    pub request_num: u64,
    pub most_recent_processed_request_num: u64,
    pub requesting_proxy: u64,
}

/// One key-range → resolver reassignment reported by the master.
#[derive(Clone, Debug)]
pub struct ResolverChange {
    pub range: KeyRange,
    pub dest: usize,
}

#[derive(Clone, Debug)]
pub struct GetCommitVersionReply {
    pub version: Version,
    pub prev_version: Version,
    pub request_num: u64,
    pub resolver_changes: Vec<ResolverChange>,
    pub resolver_changes_version: Version,
}

/// Master: live committed version for read-version assignment.
#[derive(Clone, Debug)]
pub struct GetRawCommittedVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Bytes>,
    pub min_known_committed_version: Version,
}

/// Proxy → master report emitted before the proxy updates its own view, so
/// the master's committed version is always ≥ any proxy's.
#[derive(Clone, Debug)]
pub struct ReportRawCommittedVersionRequest {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Bytes>,
    pub min_known_committed_version: Version,
}

/// Per-transaction commit status as judged by one resolver.
///
/// The ordering matters: statuses from multiple resolvers are combined with
/// `min`, so `Committed` must be the greatest value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitStatus {
    Conflict = 0,
    TooOld = 1,
    Committed = 2,
}

/// Metadata side effects of one txn-state transaction, echoed by resolvers
/// so every proxy can apply other proxies' metadata writes.
#[derive(Clone, Debug)]
pub struct StateTransaction {
    pub committed: bool,
    pub mutations: Vec<Mutation>,
}

/// One conflict-detection request for a batch, addressed to one resolver.
#[derive(Clone, Debug)]
pub struct ResolveTransactionBatchRequest {
    pub prev_version: Version,
    pub version: Version,
    pub last_received_version: Version,
    pub transactions: Vec<CommitTransaction>,
    /// Indices (into `transactions`) that carry metadata mutations. Every
    /// resolver of a batch sees the same count.
    pub txn_state_transactions: Vec<usize>,
    pub debug_id: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ResolveTransactionBatchReply {
    pub committed: Vec<CommitStatus>,
    /// `[version index][transaction index]` → other-proxy metadata effects
    /// for versions in `(last_received_version, version)`.
    pub state_mutations: Vec<Vec<StateTransaction>>,
    /// Per transaction, the resolver-local indices of conflicting
    /// read-conflict ranges (only populated when reporting was requested).
    pub conflicting_key_range_map: Vec<Vec<usize>>,
}

/// Replicated txn-state snapshot chunk replayed into a starting proxy.
#[derive(Debug)]
pub struct TxnStateRequest {
    pub data: Vec<(Bytes, Bytes)>,
    pub sequence: u64,
    pub last: bool,
    pub reply: ReplyTx<()>,
}

/// Shard-location query served from the proxy's key→info map.
#[derive(Debug)]
pub struct GetKeyServerLocationsRequest {
    pub begin: Bytes,
    pub end: Option<Bytes>,
    pub limit: usize,
    pub reverse: bool,
    pub reply: ReplyTx<GetKeyServerLocationsReply>,
}

#[derive(Clone, Debug)]
pub struct GetKeyServerLocationsReply {
    pub results: Vec<(KeyRange, Vec<u64>)>,
}

/// Rate keeper: admission advice request, carrying released-transaction
/// counts and the per-tag counters gathered since the last request.
#[derive(Clone, Debug)]
pub struct GetRateInfoRequest {
    pub requester_id: u64,
    pub total_released_transactions: i64,
    pub batch_released_transactions: i64,
    pub tag_counts: HashMap<TransactionTag, u64>,
    pub detailed: bool,
}

/// Throttle map keyed by priority, then by tag.
pub type PrioritizedThrottles = HashMap<Priority, HashMap<TransactionTag, TagThrottleInfo>>;

#[derive(Clone, Debug)]
pub struct GetRateInfoReply {
    pub transaction_rate: f64,
    pub batch_transaction_rate: f64,
    pub lease_duration: Duration,
    /// When present, atomically replaces the proxy's throttle map.
    pub throttled_tags: Option<PrioritizedThrottles>,
}

/// A log message addressed to a set of tags.
#[derive(Clone, Debug)]
pub struct TaggedMessage {
    pub tags: Vec<Tag>,
    pub message: Bytes,
}

/// Accumulates the tagged messages of one commit version.
///
/// Tags are staged with `add_tags`/`add_tag` and consumed by the next
/// `add_typed_message`, so messages are recorded in exactly the order the
/// pipeline emits them.
#[derive(Debug, Default)]
pub struct LogPushBuffer {
    pending_tags: Vec<Tag>,
    messages: Vec<TaggedMessage>,
}

impl LogPushBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.pending_tags.contains(&tag) {
            self.pending_tags.push(tag);
        }
    }

    pub fn add_tags<I: IntoIterator<Item = Tag>>(&mut self, tags: I) {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    /// Append a mutation addressed to the staged tags, consuming them.
    pub fn add_typed_message(&mut self, mutation: &Mutation) {
        let tags = std::mem::take(&mut self.pending_tags);
        self.messages.push(TaggedMessage {
            tags,
            message: mutation.encode(),
        });
    }

    /// Append a raw transaction-state message on the txs stream.
    pub fn add_txs_message(&mut self, message: Bytes) {
        self.pending_tags.clear();
        self.messages.push(TaggedMessage {
            tags: vec![TXS_TAG],
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn into_messages(self) -> Vec<TaggedMessage> {
        self.messages
    }
}

/// One push of a committed batch into the replicated log.
#[derive(Debug)]
pub struct LogPushRequest {
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub messages: Vec<TaggedMessage>,
}

/// Queue depth report from one log, used by the remote pop monitor.
#[derive(Clone, Copy, Debug)]
pub struct LogQueuingMetrics {
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::types::TAG_LOCALITY_SPECIAL;

    #[test]
    fn commit_status_min_combines_conservatively() {
        use CommitStatus::*;
        assert_eq!(Committed.min(Conflict), Conflict);
        assert_eq!(Committed.min(TooOld), TooOld);
        assert_eq!(TooOld.min(Conflict), Conflict);
        assert_eq!(Committed.min(Committed), Committed);
    }

    #[test]
    fn push_buffer_assigns_staged_tags_in_order() {
        let mut buffer = LogPushBuffer::new();
        let a = Tag::new(0, 1);
        let b = Tag::new(0, 2);
        buffer.add_tags([a, b, a]);
        buffer.add_typed_message(&Mutation::set(&b"k"[..], &b"v"[..]));
        buffer.add_tag(b);
        buffer.add_typed_message(&Mutation::set(&b"k2"[..], &b"v2"[..]));
        buffer.add_txs_message(Bytes::from_static(b"state"));

        let messages = buffer.into_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].tags, vec![a, b]);
        assert_eq!(messages[1].tags, vec![b]);
        assert_eq!(messages[2].tags, vec![Tag::new(TAG_LOCALITY_SPECIAL, 1)]);
    }
}
