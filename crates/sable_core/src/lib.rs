//! Core types for the SableStore transaction coordination layer.
//!
//! This crate provides the shared vocabulary used by the commit proxy and the
//! read-version proxy: versions, tags, key ranges and the system-key schema,
//! mutations with their atomic-op byte semantics, the keyspace-covering
//! interval map, the EMA smoother, typed client error codes, logical wire
//! shapes, and the `#[async_trait]` contracts for the collaborators a proxy
//! talks to (master, resolvers, log system, rate keeper). Higher layers supply
//! concrete collaborator implementations and drive the proxies.

pub mod atomic;
pub mod error;
pub mod interfaces;
pub mod keys;
pub mod messages;
pub mod mutation;
pub mod notified;
pub mod rangemap;
pub mod smoother;
pub mod types;

pub use error::StoreError;
pub use interfaces::{LogSystem, MasterClient, RateKeeperClient, ResolverClient};
pub use messages::{
    CommitId, CommitStatus, CommitTransaction, CommitTransactionRequest, GetCommitVersionReply,
    GetCommitVersionRequest, GetRawCommittedVersionReply, GetRateInfoReply, GetRateInfoRequest,
    GetReadVersionReply, GetReadVersionRequest, LogPushBuffer, LogPushRequest,
    ReportRawCommittedVersionRequest, ResolveTransactionBatchReply, ResolveTransactionBatchRequest,
    ResolverChange, StateTransaction, TagThrottleInfo, TaggedMessage, TxnStateRequest,
};
pub use mutation::{Mutation, MutationKind};
pub use notified::{NotifiedTime, NotifiedVersion};
pub use rangemap::RangeMap;
pub use smoother::Smoother;
pub use types::{KeyRange, Priority, Tag, TransactionTag, Version, INVALID_VERSION};
