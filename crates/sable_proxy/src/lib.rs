//! SableStore proxy roles.
//!
//! `commit_proxy` batches write transactions, pipelines them through sharded
//! conflict resolution, applies metadata side effects, dispatches mutations
//! to storage tags, and pushes through the replicated log. `grv` hands out
//! causally consistent read versions under token-bucket admission control.
//! `sim` provides in-process collaborators and `client` an embedded
//! transactional client; together they let a whole cluster run inside one
//! process for tests and the workload driver.

pub mod batcher;
pub mod client;
pub mod commit_batch;
pub mod commit_data;
pub mod commit_proxy;
pub mod config;
pub mod grv;
pub mod metadata;
pub mod resolution;
pub mod sim;
pub mod txn_state;
mod util;

pub use client::{Database, Transaction, TransactionOptions, Watch};
pub use commit_data::CommitProxyData;
pub use commit_proxy::{commit_proxy_server, CommitProxyChannels};
pub use config::{CommitProxyConfig, GrvProxyConfig, TransactionLimits};
pub use grv::{grv_proxy_server, GrvProxyData};
pub use sim::{SimCluster, SimClusterConfig};
