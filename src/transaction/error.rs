//! Transaction error types.

use std::fmt;

use thiserror::Error;

use crate::db::DriverError;
use crate::transaction::identity::TxIdentity;
use crate::transaction::state::TxStatus;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// The coordinator operation that was in progress when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Acquire,
    Begin,
    Commit,
    Rollback,
    SetAutoCommit,
    SetIsolation,
    Execute,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Acquire => "acquire connection",
            Operation::Begin => "begin",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
            Operation::SetAutoCommit => "set auto-commit",
            Operation::SetIsolation => "set isolation level",
            Operation::Execute => "use connection of",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A driver call failed.
    #[error("{operation} failed for {identity}: {source}")]
    Resource {
        identity: TxIdentity,
        operation: Operation,
        #[source]
        source: DriverError,
    },

    /// Commit failed; the automatic rollback that followed succeeded.
    #[error("commit failed for {identity}, transaction rolled back: {source}")]
    CommitFailed {
        identity: TxIdentity,
        #[source]
        source: DriverError,
    },

    /// Commit failed and so did the rollback after it. The connection was
    /// released in an unknown state.
    #[error(
        "commit failed for {identity} and rollback failed too, \
         connection state is indeterminate (commit: {commit_error}; rollback: {rollback_error})"
    )]
    Indeterminate {
        identity: TxIdentity,
        commit_error: DriverError,
        rollback_error: DriverError,
    },

    /// The final `commit` found the transaction marked rollback-only by a
    /// nested participant and rolled it back instead.
    #[error("transaction {identity} was marked rollback-only and has been rolled back")]
    MarkedRollback { identity: TxIdentity },

    /// Operation not valid for the transaction's current status.
    #[error("cannot {operation} {identity}: transaction is {status}")]
    IllegalState {
        identity: TxIdentity,
        status: TxStatus,
        operation: Operation,
    },

    /// Code run outside the current transaction began a transaction on the
    /// same identity and never closed it.
    #[error("detached scope leaked an unclosed transaction for {identity}")]
    LeakedTransaction { identity: TxIdentity },
}

impl TransactionError {
    pub(crate) fn resource(identity: &TxIdentity, operation: Operation, source: DriverError) -> Self {
        Self::Resource {
            identity: identity.clone(),
            operation,
            source,
        }
    }

    pub(crate) fn illegal_state(identity: &TxIdentity, status: TxStatus, operation: Operation) -> Self {
        Self::IllegalState {
            identity: identity.clone(),
            status,
            operation,
        }
    }

    /// Identity of the transaction the error belongs to.
    pub fn identity(&self) -> &TxIdentity {
        match self {
            TransactionError::Resource { identity, .. }
            | TransactionError::CommitFailed { identity, .. }
            | TransactionError::Indeterminate { identity, .. }
            | TransactionError::MarkedRollback { identity }
            | TransactionError::IllegalState { identity, .. }
            | TransactionError::LeakedTransaction { identity } => identity,
        }
    }

    /// Whether the error originates from the driver.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            TransactionError::Resource { .. }
                | TransactionError::CommitFailed { .. }
                | TransactionError::Indeterminate { .. }
        )
    }

    /// Whether the connection was left in a state the application cannot
    /// recover from automatically.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, TransactionError::Indeterminate { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, TransactionError::IllegalState { .. })
    }

    /// Check if this error is retryable: the work was rolled back cleanly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransactionError::CommitFailed { .. } | TransactionError::MarkedRollback { .. }
        )
    }
}
