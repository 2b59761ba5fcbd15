//! Data model shared by the dashkit transaction core.
//!
//! Operations, transactions, their configuration and the error taxonomy live
//! here so that the manager, the registry and the data view agree on one
//! vocabulary.

pub mod config;
pub mod error;
pub mod operation;
pub mod summary;
pub mod transaction;

pub use config::{DashkitConfig, DataViewConfig, TransactionConfig, TransactionConfigOverride, TransactionMode};
pub use error::{Result, TxError};
pub use operation::{new_operation_id, Mutation, MutationFuture, NewOperation, Operation, OperationTrigger, OperationType};
pub use summary::{TransactionSummary, TriggerCounts, TypeCounts};
pub use transaction::{Transaction, TransactionResult, TransactionStatus};
