use thiserror::Error;

use crate::transaction::TransactionStatus;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("No active transaction")]
    NoActiveTransaction,
    #[error("Transactions are disabled for this manager")]
    Disabled,
    #[error("Transaction {transaction_id} is executing; operations cannot be changed")]
    CommitInProgress { transaction_id: String },
    #[error("Operation not found: {0}")]
    OperationNotFound(String),
    #[error("Invalid transaction status change: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("Operation {operation_id} ({label}) in transaction {transaction_id} failed: {source:#}")]
    OperationMutationFailed {
        transaction_id: String,
        operation_id: String,
        label: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{failed} of {total} operations failed; first failure: {first}")]
    BatchFailed {
        failed: usize,
        total: usize,
        first: Box<TxError>,
    },
    #[error("Transaction {transaction_id} rolled back: {source}")]
    TransactionRolledBack {
        transaction_id: String,
        #[source]
        source: Box<TxError>,
    },
    #[error("Transaction {transaction_id} rolled back with {failed_compensations} failed compensating actions: {source}")]
    RollbackIncomplete {
        transaction_id: String,
        failed_compensations: usize,
        #[source]
        source: Box<TxError>,
    },
    #[error("Scheduled commit aborted: {0}")]
    CommitAborted(String),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl TxError {
    /// Whether this error left the transaction rolled back (fully or not).
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            TxError::TransactionRolledBack { .. } | TxError::RollbackIncomplete { .. }
        )
    }

    /// Number of operations that failed in the commit that produced this error.
    pub fn failure_count(&self) -> usize {
        match self {
            TxError::OperationMutationFailed { .. } => 1,
            TxError::BatchFailed { failed, .. } => *failed,
            TxError::TransactionRolledBack { source, .. }
            | TxError::RollbackIncomplete { source, .. } => source.failure_count(),
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
