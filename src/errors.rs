use thiserror::Error;

use crate::transaction::TxnStatus;

/// Typed errors for STM operations.
///
/// Variants fall into four groups:
///
/// - **Control flow**: conflicts the retry loop recovers from by running the
///   body again (`ReadConflict`, `StaleRead`, `WriteConflict`, `LockNotAcquired`,
///   `SpeculativeFailure`, `Retry`).
/// - **Blocking outcomes**: terminal results of a blocking retry
///   (`RetryTimeout`, `RetryInterrupted`, `TooManyRetries`, `NoRetryPossible`).
/// - **Misuse**: programming errors that are never retried.
/// - **Domain**: errors raised by the transaction body itself, returned unchanged
///   after the transaction was rolled back.
#[derive(Debug, Error)]
pub enum StmError {
    /// The object is exclusively locked by a committing transaction.
    #[error("read conflict on object {object}: locked by transaction {owner}")]
    ReadConflict { object: u64, owner: u64 },

    /// The object was overwritten after this transaction's snapshot was taken.
    #[error("stale read on object {object}: version {version} is newer than read version {read_version}")]
    StaleRead {
        object: u64,
        version: u64,
        read_version: u64,
    },

    /// Commit-time validation found a newer committed record.
    #[error("write conflict on object {object}")]
    WriteConflict { object: u64 },

    /// The commit lock policy could not lock the whole write set.
    #[error("could not acquire commit locks for transaction {txn}")]
    LockNotAcquired { txn: u64 },

    /// The speculative configuration of the family was too lean; run again fattened.
    #[error("speculative configuration failure, transaction restarts with a larger profile")]
    SpeculativeFailure,

    /// Blocking retry requested by the transaction body.
    #[error("transaction retry requested")]
    Retry,

    /// A blocking retry waited longer than the configured timeout.
    #[error("retry timed out after waiting {waited_ms} ms")]
    RetryTimeout { waited_ms: u128 },

    /// A blocking retry was interrupted.
    #[error("retry was interrupted")]
    RetryInterrupted,

    /// The retry budget of the family is exhausted.
    #[error("transaction '{family}' exceeded the maximum of {max_retries} retries")]
    TooManyRetries { family: String, max_retries: u32 },

    /// A blocking retry cannot be performed.
    #[error("retry is not possible: {reason}")]
    NoRetryPossible { reason: &'static str },

    /// The transaction already committed or aborted.
    #[error("transaction {txn} is dead (status {status:?})")]
    DeadTransaction { txn: u64, status: TxnStatus },

    /// A write was attempted inside a readonly transaction.
    #[error("readonly transaction '{family}' attempted to write object {object}")]
    ReadonlyViolation { family: String, object: u64 },

    /// The object already has committed state and cannot be constructed.
    #[error("object {object} is already constructed")]
    AlreadyConstructed { object: u64 },

    /// The object was never committed and this transaction is not constructing it.
    #[error("object {object} is not committed yet")]
    UncommittedRead { object: u64 },

    /// The transaction was marked abort-only.
    #[error("transaction {txn} is abort only")]
    AbortOnly { txn: u64 },

    /// The object id is attached with a different value type.
    #[error("object {object} is attached with a different value type")]
    TypeMismatch { object: u64 },

    /// No transaction is bound to the current thread.
    #[error("no transaction is bound to the current thread")]
    NoTransaction,

    /// Invalid transaction configuration.
    #[error("invalid transaction configuration: {0}")]
    Config(String),

    /// Error raised by the transaction body.
    #[error("transaction body failed: {0}")]
    Domain(Box<dyn std::error::Error + Send + Sync>),
}

impl StmError {
    /// Wrap a domain error raised inside a transaction body.
    pub fn domain<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StmError::Domain(err.into())
    }

    /// Conflicts the retry loop recovers from by running the body again.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StmError::ReadConflict { .. }
                | StmError::StaleRead { .. }
                | StmError::WriteConflict { .. }
                | StmError::LockNotAcquired { .. }
                | StmError::SpeculativeFailure
                | StmError::Retry
        )
    }

    /// Terminal results of blocking retries and exhausted retry budgets.
    pub fn is_blocking_outcome(&self) -> bool {
        matches!(
            self,
            StmError::RetryTimeout { .. }
                | StmError::RetryInterrupted
                | StmError::TooManyRetries { .. }
                | StmError::NoRetryPossible { .. }
        )
    }

    /// Programming errors; never retried.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            StmError::DeadTransaction { .. }
                | StmError::ReadonlyViolation { .. }
                | StmError::AlreadyConstructed { .. }
                | StmError::UncommittedRead { .. }
                | StmError::AbortOnly { .. }
                | StmError::TypeMismatch { .. }
                | StmError::NoTransaction
                | StmError::Config(_)
        )
    }
}
