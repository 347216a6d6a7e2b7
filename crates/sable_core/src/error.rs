//! Typed error codes for the transaction subsystem.
//!
//! The numeric codes are part of the client wire contract and must not drift.
//! Predicates classify errors the way the client retry loop and the proxy
//! shutdown path need them: retryable, maybe-committed, and proxy-fatal.

use thiserror::Error;

/// Errors surfaced by the transaction coordination layer.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction is too old to perform reads or be committed")]
    TransactionTooOld,
    #[error("request for future version")]
    FutureVersion,
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted,
    #[error("transaction may or may not have committed")]
    CommitUnknownResult,
    #[error("operation aborted because the transaction was cancelled")]
    TransactionCancelled,
    #[error("operation aborted because the transaction timed out")]
    TransactionTimedOut,
    #[error("too many watches currently set")]
    TooManyWatches,
    #[error("watches cannot be set if read-your-writes is disabled")]
    WatchesDisabled,
    #[error("read or wrote an unreadable key")]
    AccessedUnreadable,
    #[error("database is locked")]
    DatabaseLocked,
    #[error("commit proxy memory limit exceeded")]
    ProxyMemoryLimitExceeded,
    #[error("batch GRV request rate limit exceeded")]
    BatchTransactionThrottled,
    #[error("asynchronous operation cancelled")]
    OperationCancelled,
    #[error("broken promise")]
    BrokenPromise,
    #[error("future has been released")]
    FutureReleased,
    #[error("key outside legal range")]
    KeyOutsideLegalRange,
    #[error("range begin key larger than end key")]
    InvertedRange,
    #[error("option set with an invalid value")]
    InvalidOptionValue,
    #[error("option not valid in this context")]
    InvalidOption,
    #[error("operation issued while a commit was outstanding")]
    UsedDuringCommit,
    #[error("the operation cannot be performed on the network thread")]
    BlockedFromNetworkThread,
    #[error("transaction exceeds byte limit")]
    TransactionTooLarge,
    #[error("key length exceeds limit")]
    KeyTooLarge,
    #[error("value length exceeds limit")]
    ValueTooLarge,
    #[error("invalid client operation")]
    ClientInvalidOperation,

    // Proxy-fatal set: terminate the role cleanly so the cluster can recruit
    // a replacement.
    #[error("normal worker shut down")]
    WorkerRemoved,
    #[error("transaction log stopped")]
    TlogStopped,
    #[error("master terminating because a transaction log failed")]
    MasterTlogFailed,
    #[error("coordinators have been changed")]
    CoordinatorsChanged,
    #[error("conflict occurred while changing coordination information")]
    CoordinatedStateConflict,
    #[error("timed out changing coordination information")]
    NewCoordinatorsTimedOut,
}

impl StoreError {
    /// Bit-exact numeric code of this error.
    pub fn code(&self) -> i32 {
        use StoreError::*;
        match self {
            TransactionTooOld => 1007,
            FutureVersion => 1009,
            NotCommitted => 1020,
            CommitUnknownResult => 1021,
            TransactionCancelled => 1025,
            TransactionTimedOut => 1031,
            TooManyWatches => 1032,
            WatchesDisabled => 1034,
            AccessedUnreadable => 1036,
            DatabaseLocked => 1038,
            ProxyMemoryLimitExceeded => 1040,
            BatchTransactionThrottled => 1051,
            BrokenPromise => 1100,
            OperationCancelled => 1101,
            FutureReleased => 1102,
            WorkerRemoved => 1202,
            TlogStopped => 1204,
            MasterTlogFailed => 1205,
            CoordinatorsChanged => 1207,
            CoordinatedStateConflict => 1210,
            NewCoordinatorsTimedOut => 1211,
            KeyOutsideLegalRange => 2004,
            InvertedRange => 2005,
            InvalidOptionValue => 2006,
            InvalidOption => 2007,
            UsedDuringCommit => 2017,
            BlockedFromNetworkThread => 2026,
            TransactionTooLarge => 2101,
            KeyTooLarge => 2102,
            ValueTooLarge => 2103,
            ClientInvalidOperation => 2108,
        }
    }

    /// Errors the client library retries transparently.
    pub fn is_retryable(&self) -> bool {
        use StoreError::*;
        matches!(
            self,
            TransactionTooOld
                | NotCommitted
                | CommitUnknownResult
                | TransactionTimedOut
                | AccessedUnreadable
                | DatabaseLocked
        )
    }

    /// Retryable, but the commit may have already applied.
    pub fn is_maybe_committed(&self) -> bool {
        matches!(self, StoreError::CommitUnknownResult)
    }

    /// Errors on which a proxy exits cleanly instead of crashing.
    pub fn is_proxy_fatal(&self) -> bool {
        use StoreError::*;
        matches!(
            self,
            WorkerRemoved
                | TlogStopped
                | MasterTlogFailed
                | CoordinatorsChanged
                | CoordinatedStateConflict
                | NewCoordinatorsTimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_bit_exact() {
        assert_eq!(StoreError::TransactionTooOld.code(), 1007);
        assert_eq!(StoreError::FutureVersion.code(), 1009);
        assert_eq!(StoreError::NotCommitted.code(), 1020);
        assert_eq!(StoreError::CommitUnknownResult.code(), 1021);
        assert_eq!(StoreError::TransactionCancelled.code(), 1025);
        assert_eq!(StoreError::TransactionTimedOut.code(), 1031);
        assert_eq!(StoreError::TooManyWatches.code(), 1032);
        assert_eq!(StoreError::WatchesDisabled.code(), 1034);
        assert_eq!(StoreError::DatabaseLocked.code(), 1038);
        assert_eq!(StoreError::ProxyMemoryLimitExceeded.code(), 1040);
        assert_eq!(StoreError::BatchTransactionThrottled.code(), 1051);
        assert_eq!(StoreError::OperationCancelled.code(), 1101);
        assert_eq!(StoreError::FutureReleased.code(), 1102);
        assert_eq!(StoreError::KeyOutsideLegalRange.code(), 2004);
        assert_eq!(StoreError::InvalidOptionValue.code(), 2006);
        assert_eq!(StoreError::BlockedFromNetworkThread.code(), 2026);
        assert_eq!(StoreError::TransactionTooLarge.code(), 2101);
    }

    #[test]
    fn retry_predicates_partition_the_codes() {
        assert!(StoreError::NotCommitted.is_retryable());
        assert!(StoreError::CommitUnknownResult.is_retryable());
        assert!(StoreError::CommitUnknownResult.is_maybe_committed());
        assert!(!StoreError::NotCommitted.is_maybe_committed());
        assert!(!StoreError::ProxyMemoryLimitExceeded.is_retryable());
        assert!(!StoreError::BatchTransactionThrottled.is_retryable());
        assert!(!StoreError::KeyOutsideLegalRange.is_retryable());
    }

    #[test]
    fn proxy_fatal_set_is_exact() {
        for fatal in [
            StoreError::WorkerRemoved,
            StoreError::TlogStopped,
            StoreError::MasterTlogFailed,
            StoreError::CoordinatorsChanged,
            StoreError::CoordinatedStateConflict,
            StoreError::NewCoordinatorsTimedOut,
        ] {
            assert!(fatal.is_proxy_fatal(), "{fatal:?}");
        }
        assert!(!StoreError::NotCommitted.is_proxy_fatal());
        assert!(!StoreError::BrokenPromise.is_proxy_fatal());
    }
}
