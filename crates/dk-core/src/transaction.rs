use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::config::TransactionConfig;
use crate::error::{Result, TxError};
use crate::operation::Operation;

/// Lifecycle status of a transaction.
///
/// `Pending -> [Reviewing] -> Executing -> Completed | Failed | RolledBack`,
/// with `Cancelled` reachable from `Pending` and `Reviewing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Reviewing,
    Executing,
    Completed,
    Failed,
    Cancelled,
    #[serde(rename = "rolledback")]
    RolledBack,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Reviewing)
                | (Pending, Executing)
                | (Pending, Cancelled)
                | (Reviewing, Executing)
                | (Reviewing, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, RolledBack)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Reviewing => "reviewing",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolledback",
        };
        f.write_str(s)
    }
}

/// Outcome of executing one operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub success: bool,
    pub operation: Operation,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TransactionResult {
    pub fn ok(operation: Operation, result: Value, duration_ms: u64) -> Self {
        Self { success: true, operation, result: Some(result), error: None, duration_ms }
    }

    pub fn failed(operation: Operation, error: &anyhow::Error, duration_ms: u64) -> Self {
        Self {
            success: false,
            operation,
            result: None,
            error: Some(format!("{error:#}")),
            duration_ms,
        }
    }
}

/// Ordered batch of operations sharing one commit/cancel lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<Operation>,
    pub status: TransactionStatus,
    pub results: Vec<TransactionResult>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: TransactionConfig,
    pub total_operations: usize,
}

impl Transaction {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            id: format!("tx_{}", Uuid::new_v4().simple()),
            operations: Vec::new(),
            status: TransactionStatus::Pending,
            results: Vec::new(),
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            config,
            total_operations: 0,
        }
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
        self.total_operations = self.operations.len();
    }

    pub fn remove(&mut self, operation_id: &str) -> Option<Operation> {
        let idx = self.operations.iter().position(|o| o.id == operation_id)?;
        let removed = self.operations.remove(idx);
        self.total_operations = self.operations.len();
        Some(removed)
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TxError::InvalidTransition { from: self.status, to: next });
        }
        match next {
            TransactionStatus::Executing => self.executed_at = Some(Utc::now()),
            TransactionStatus::Completed
            | TransactionStatus::Failed
            | TransactionStatus::RolledBack => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        tracing::trace!(tx = %self.id, from = %self.status, to = %next, "transaction status change");
        self.status = next;
        Ok(())
    }
}
