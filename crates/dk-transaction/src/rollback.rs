//! Best-effort compensation of operations that already succeeded.

use async_trait::async_trait;
use dk_core::{Operation, TransactionResult};
use serde_json::Value;

/// Issues inverse calls for operations that must be undone.
///
/// create -> delete the created entity, update -> write `original_data`
/// back, delete -> recreate from `original_data`.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(&self, operation: &Operation, result: Option<&Value>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    /// Operations whose compensating action succeeded.
    pub rolled_back: Vec<Operation>,
    pub failed: usize,
    /// Operations with no compensating action available.
    pub skipped: usize,
}

/// Compensate `successes` in the order given; callers pass them newest first.
///
/// A failing compensation is logged and the pass continues.
pub(crate) async fn compensate_all(
    transaction_id: &str,
    successes: Vec<&TransactionResult>,
    compensator: Option<&dyn Compensator>,
) -> RollbackOutcome {
    let mut outcome = RollbackOutcome::default();
    tracing::info!(tx = transaction_id, count = successes.len(), "starting rollback");

    for done in successes {
        let op = &done.operation;
        let attempt = match (&op.rollback, compensator) {
            (Some(rollback), _) => rollback.call().await.map(|_| ()),
            (None, Some(c)) => c.compensate(op, done.result.as_ref()).await,
            (None, None) => {
                tracing::warn!(
                    tx = transaction_id,
                    op = %op.id,
                    kind = %op.op_type,
                    "no compensating action for operation, rollback skipped"
                );
                outcome.skipped += 1;
                continue;
            }
        };
        match attempt {
            Ok(()) => {
                tracing::info!(tx = transaction_id, op = %op.id, label = %op.label, "rolled back operation");
                outcome.rolled_back.push(op.clone());
            }
            Err(e) => {
                tracing::error!(tx = transaction_id, op = %op.id, error = %format!("{e:#}"), "compensating action failed");
                outcome.failed += 1;
            }
        }
    }

    tracing::info!(
        tx = transaction_id,
        rolled_back = outcome.rolled_back.len(),
        failed = outcome.failed,
        skipped = outcome.skipped,
        "rollback finished"
    );
    outcome
}
