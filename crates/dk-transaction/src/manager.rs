//! Single-transaction coordinator: begin, add, commit, cancel.

use dk_core::{
    NewOperation, Operation, Result, Transaction, TransactionConfig, TransactionConfigOverride,
    TransactionResult, TransactionStatus, TransactionSummary, TxError,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{EventBus, EventKind, Subscription, TransactionEvent};
use crate::rollback::{compensate_all, Compensator};

type ScheduledCommit = JoinHandle<Result<Vec<TransactionResult>>>;

#[derive(Default)]
struct ManagerState {
    current: Option<Transaction>,
    last: Option<Transaction>,
    commit_scheduled: bool,
}

/// Owns at most one live transaction and executes it on commit.
///
/// Shared as `Arc<TransactionManager>`; every method takes `&self`. No lock is
/// held across an await or while event handlers run.
pub struct TransactionManager {
    id: String,
    config: RwLock<TransactionConfig>,
    state: Mutex<ManagerState>,
    events: EventBus,
    compensator: Option<Arc<dyn Compensator>>,
    scheduled: Mutex<Option<ScheduledCommit>>,
    me: Weak<TransactionManager>,
}

#[derive(Default)]
pub struct ManagerBuilder {
    id: Option<String>,
    config: TransactionConfig,
    compensator: Option<Arc<dyn Compensator>>,
}

impl ManagerBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensator = Some(compensator);
        self
    }

    pub fn build(self) -> Arc<TransactionManager> {
        let id = self.id.unwrap_or_else(|| format!("mgr_{}", Uuid::new_v4().simple()));
        Arc::new_cyclic(|me| TransactionManager {
            id,
            config: RwLock::new(self.config),
            state: Mutex::new(ManagerState::default()),
            events: EventBus::new(),
            compensator: self.compensator,
            scheduled: Mutex::new(None),
            me: me.clone(),
        })
    }
}

impl TransactionManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn new(config: TransactionConfig) -> Arc<Self> {
        Self::builder().config(config).build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base configuration used for the next transaction.
    pub fn config(&self) -> TransactionConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: TransactionConfig) {
        *self.config.write() = config;
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on(&self, kind: EventKind, handler: impl Fn(&TransactionEvent) + Send + Sync + 'static) -> Subscription {
        self.events.on(kind, handler)
    }

    pub fn subscribe(&self, handler: impl Fn(&TransactionEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    // ========== Lifecycle ==========

    /// Start a transaction. If one is already open its id is returned unchanged.
    pub fn begin(&self, patch: Option<&TransactionConfigOverride>) -> String {
        let started = {
            let mut state = self.state.lock();
            if let Some(tx) = &state.current {
                tracing::debug!(manager = %self.id, tx = %tx.id, "begin called with an open transaction");
                return tx.id.clone();
            }
            let base = self.config.read().clone();
            let config = match patch {
                Some(p) => base.merged(p),
                None => base,
            };
            let tx = Transaction::new(config);
            state.current = Some(tx.clone());
            tx
        };
        tracing::debug!(manager = %self.id, tx = %started.id, mode = ?started.config.mode, "transaction started");
        let id = started.id.clone();
        self.events.emit(&TransactionEvent::TransactionStart { transaction: started });
        id
    }

    /// Append an operation, opening a transaction if needed, and schedule an
    /// auto-commit when the transaction's policy asks for one.
    pub fn add_operation(&self, new: NewOperation) -> Result<String> {
        if !self.config.read().enabled {
            return Err(TxError::Disabled);
        }
        if !self.has_transaction() {
            self.begin(None);
        }

        let (tx_id, operation, schedule, delay) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(tx) = state.current.as_mut() else {
                return Err(TxError::NoActiveTransaction);
            };
            if tx.status == TransactionStatus::Executing {
                return Err(TxError::CommitInProgress { transaction_id: tx.id.clone() });
            }
            let operation = new.into_operation();
            tx.push(operation.clone());

            let auto = tx.config.should_auto_commit(operation.trigger, tx.operations.len());
            let schedule = auto && !state.commit_scheduled;
            if schedule {
                state.commit_scheduled = true;
            }
            (tx.id.clone(), operation, schedule, tx.config.auto_commit_delay_ms)
        };

        tracing::debug!(manager = %self.id, tx = %tx_id, op = %operation.id, kind = %operation.op_type, "operation added");
        let op_id = operation.id.clone();
        self.events.emit(&TransactionEvent::OperationAdded { transaction_id: tx_id, operation });
        if schedule {
            self.schedule_commit(Duration::from_millis(delay));
        }
        Ok(op_id)
    }

    fn schedule_commit(&self, delay: Duration) {
        let Some(me) = self.me.upgrade() else { return };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(manager = %self.id, "no async runtime available, auto-commit skipped");
            self.state.lock().commit_scheduled = false;
            return;
        };
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            me.state.lock().commit_scheduled = false;
            let outcome = me.commit(false).await;
            match &outcome {
                Err(TxError::NoActiveTransaction) => {
                    tracing::debug!(manager = %me.id, "auto-commit found nothing to commit");
                }
                Err(e) => tracing::warn!(manager = %me.id, error = %e, "auto-commit failed"),
                Ok(results) => tracing::debug!(manager = %me.id, count = results.len(), "auto-commit finished"),
            }
            outcome
        });
        *self.scheduled.lock() = Some(handle);
    }

    /// Await the most recently scheduled auto-commit and hand back its outcome.
    ///
    /// Returns `None` when no auto-commit was scheduled since the last call.
    pub async fn wait_for_auto_commit(&self) -> Option<Result<Vec<TransactionResult>>> {
        let handle = self.scheduled.lock().take()?;
        Some(match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(TxError::CommitAborted(e.to_string())),
        })
    }

    pub fn has_scheduled_commit(&self) -> bool {
        self.state.lock().commit_scheduled
    }

    /// Remove a not-yet-executed operation.
    pub fn remove_operation(&self, operation_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.current.as_mut() {
                Some(tx) if tx.status != TransactionStatus::Executing => {
                    tx.remove(operation_id).map(|op| (tx.id.clone(), op))
                }
                _ => None,
            }
        };
        match removed {
            Some((transaction_id, operation)) => {
                self.events.emit(&TransactionEvent::OperationRemoved { transaction_id, operation });
                true
            }
            None => false,
        }
    }

    /// Execute the open transaction.
    ///
    /// With `require_confirmation` set and `force` false the transaction moves
    /// to `reviewing` and nothing runs. Immediate mode runs operations one by
    /// one and stops at the first failure; every other mode runs them
    /// concurrently. Any failure rolls back the successes of this commit.
    pub async fn commit(&self, force: bool) -> Result<Vec<TransactionResult>> {
        let (tx_id, operations, config) = {
            let mut state = self.state.lock();
            let Some(tx) = state.current.as_mut() else {
                return Err(TxError::NoActiveTransaction);
            };
            if tx.status == TransactionStatus::Executing {
                return Err(TxError::CommitInProgress { transaction_id: tx.id.clone() });
            }
            if tx.config.require_confirmation && !force {
                if tx.status == TransactionStatus::Pending {
                    tx.transition(TransactionStatus::Reviewing)?;
                }
                tracing::info!(manager = %self.id, tx = %tx.id, "transaction awaiting confirmation");
                return Ok(Vec::new());
            }
            tx.transition(TransactionStatus::Executing)?;
            (tx.id.clone(), tx.operations.clone(), tx.config.clone())
        };

        tracing::info!(
            manager = %self.id,
            tx = %tx_id,
            count = operations.len(),
            sequential = config.is_sequential(),
            "executing transaction"
        );
        let (results, failure) = if config.is_sequential() {
            self.run_sequential(&tx_id, operations).await
        } else {
            self.run_batch(&tx_id, operations).await
        };

        match failure {
            None => {
                let finished = self.finish(&tx_id, results.clone(), TransactionStatus::Completed)?;
                tracing::info!(manager = %self.id, tx = %tx_id, "transaction completed");
                self.events.emit(&TransactionEvent::TransactionComplete {
                    transaction: finished,
                    results: results.clone(),
                });
                Ok(results)
            }
            Some(err) => Err(self.roll_back(&tx_id, results, err).await),
        }
    }

    async fn run_sequential(
        &self,
        tx_id: &str,
        operations: Vec<Operation>,
    ) -> (Vec<TransactionResult>, Option<TxError>) {
        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            let started = Instant::now();
            let outcome = op.mutation.call().await;
            let elapsed = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(value) => {
                    let result = TransactionResult::ok(op, value, elapsed);
                    self.emit_operation_complete(tx_id, &result);
                    results.push(result);
                }
                Err(e) => {
                    tracing::warn!(tx = tx_id, op = %op.id, error = %format!("{e:#}"), "operation failed");
                    let result = TransactionResult::failed(op.clone(), &e, elapsed);
                    self.emit_operation_complete(tx_id, &result);
                    results.push(result);
                    let err = TxError::OperationMutationFailed {
                        transaction_id: tx_id.to_string(),
                        operation_id: op.id,
                        label: op.label,
                        source: e,
                    };
                    return (results, Some(err));
                }
            }
        }
        (results, None)
    }

    async fn run_batch(
        &self,
        tx_id: &str,
        operations: Vec<Operation>,
    ) -> (Vec<TransactionResult>, Option<TxError>) {
        let total = operations.len();
        let mut pending: FuturesUnordered<_> = operations
            .into_iter()
            .map(|op| async move {
                let started = Instant::now();
                let outcome = op.mutation.call().await;
                (op, outcome, started.elapsed().as_millis() as u64)
            })
            .collect();

        // Results are kept in completion order.
        let mut results = Vec::with_capacity(total);
        let mut failed = 0;
        let mut first: Option<TxError> = None;
        while let Some((op, outcome, elapsed)) = pending.next().await {
            let result = match outcome {
                Ok(value) => TransactionResult::ok(op, value, elapsed),
                Err(e) => {
                    tracing::warn!(tx = tx_id, op = %op.id, error = %format!("{e:#}"), "operation failed");
                    failed += 1;
                    let result = TransactionResult::failed(op.clone(), &e, elapsed);
                    if first.is_none() {
                        first = Some(TxError::OperationMutationFailed {
                            transaction_id: tx_id.to_string(),
                            operation_id: op.id,
                            label: op.label,
                            source: e,
                        });
                    }
                    result
                }
            };
            self.emit_operation_complete(tx_id, &result);
            results.push(result);
        }

        let failure = first.map(|first| TxError::BatchFailed {
            failed,
            total,
            first: Box::new(first),
        });
        (results, failure)
    }

    fn emit_operation_complete(&self, tx_id: &str, result: &TransactionResult) {
        self.events.emit(&TransactionEvent::OperationComplete {
            transaction_id: tx_id.to_string(),
            result: result.clone(),
        });
    }

    async fn roll_back(&self, tx_id: &str, results: Vec<TransactionResult>, cause: TxError) -> TxError {
        let successes: Vec<&TransactionResult> = results.iter().filter(|r| r.success).rev().collect();
        let outcome = compensate_all(tx_id, successes, self.compensator.as_deref()).await;

        let status = if outcome.failed > 0 {
            TransactionStatus::Failed
        } else {
            TransactionStatus::RolledBack
        };
        let finished = match self.finish(tx_id, results, status) {
            Ok(tx) => tx,
            Err(e) => return e,
        };
        let error = cause.to_string();
        tracing::warn!(manager = %self.id, tx = tx_id, %status, error = %error, "transaction rolled back");

        self.events.emit(&TransactionEvent::TransactionError {
            transaction: finished.clone(),
            error,
        });
        self.events.emit(&TransactionEvent::RollbackComplete {
            transaction: finished,
            rolled_back: outcome.rolled_back,
            failed: outcome.failed,
        });

        if outcome.failed > 0 {
            TxError::RollbackIncomplete {
                transaction_id: tx_id.to_string(),
                failed_compensations: outcome.failed,
                source: Box::new(cause),
            }
        } else {
            TxError::TransactionRolledBack {
                transaction_id: tx_id.to_string(),
                source: Box::new(cause),
            }
        }
    }

    /// Move the executing transaction to its terminal status and return to idle.
    fn finish(
        &self,
        tx_id: &str,
        results: Vec<TransactionResult>,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut state = self.state.lock();
        let mut tx = match state.current.take() {
            Some(tx) if tx.id == tx_id => tx,
            other => {
                state.current = other;
                return Err(TxError::NoActiveTransaction);
            }
        };
        tx.results = results;
        tx.transition(status)?;
        state.last = Some(tx.clone());
        Ok(tx)
    }

    /// Discard the open transaction without touching the server.
    ///
    /// Refused while the transaction is executing.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            match state.current.take() {
                None => return false,
                Some(tx) if tx.status == TransactionStatus::Executing => {
                    tracing::warn!(manager = %self.id, tx = %tx.id, "cannot cancel an executing transaction");
                    state.current = Some(tx);
                    return false;
                }
                Some(mut tx) => {
                    if let Err(e) = tx.transition(TransactionStatus::Cancelled) {
                        tracing::warn!(manager = %self.id, error = %e, "cancel outside the state machine");
                    }
                    state.commit_scheduled = false;
                    state.last = Some(tx.clone());
                    tx
                }
            }
        };
        if let Some(handle) = self.scheduled.lock().take() {
            handle.abort();
        }
        tracing::info!(manager = %self.id, tx = %cancelled.id, count = cancelled.operations.len(), "transaction cancelled");
        self.events.emit(&TransactionEvent::TransactionCancelled { transaction: cancelled });
        true
    }

    /// Drop the open transaction without emitting events.
    pub fn clear(&self) -> bool {
        {
            let mut state = self.state.lock();
            match &state.current {
                Some(tx) if tx.status == TransactionStatus::Executing => return false,
                Some(_) => {
                    state.current = None;
                    state.commit_scheduled = false;
                }
                None => return false,
            }
        }
        // The pending timer belongs to the cleared transaction.
        if let Some(handle) = self.scheduled.lock().take() {
            handle.abort();
        }
        true
    }

    // ========== Inspection ==========

    pub fn has_transaction(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn status(&self) -> Option<TransactionStatus> {
        self.state.lock().current.as_ref().map(|tx| tx.status)
    }

    pub fn get_transaction(&self) -> Option<Transaction> {
        self.state.lock().current.clone()
    }

    /// Most recent transaction that reached a terminal status.
    pub fn last_transaction(&self) -> Option<Transaction> {
        self.state.lock().last.clone()
    }

    pub fn get_operations(&self) -> Vec<Operation> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|tx| tx.operations.clone())
            .unwrap_or_default()
    }

    pub fn get_summary(&self) -> TransactionSummary {
        match &self.state.lock().current {
            Some(tx) => TransactionSummary::from_operations(&tx.operations),
            None => TransactionSummary::default(),
        }
    }

    pub fn has_operations(&self) -> bool {
        self.state.lock().current.as_ref().is_some_and(|tx| !tx.is_empty())
    }

    pub fn can_commit(&self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_empty() && tx.status == TransactionStatus::Pending)
    }

    /// Rough, advisory duration of committing what is pending now.
    pub fn estimate_duration(&self) -> Duration {
        let state = self.state.lock();
        let (count, cfg) = match &state.current {
            Some(tx) => (tx.operations.len() as u64, tx.config.clone()),
            None => (0, self.config.read().clone()),
        };
        Duration::from_millis(count * cfg.operation_cost_ms + cfg.overhead_ms)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
