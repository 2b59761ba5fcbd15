use crate::*;
use async_trait::async_trait;
use dk_core::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ok_op(entity_type: &str, id: &str) -> NewOperation {
    NewOperation::create(entity_type, id, json!({"id": id}), Mutation::ready(json!({"id": id})))
}

fn failing_op(id: &str, message: &'static str) -> NewOperation {
    NewOperation::update("user", id, json!({"id": id}), json!({"id": id}), Mutation::new(move || async move {
        Err::<Value, _>(anyhow::anyhow!(message))
    }))
}

fn user_controlled() -> Arc<TransactionManager> {
    TransactionManager::new(TransactionConfig::with_mode(TransactionMode::UserControlled))
}

#[derive(Default)]
struct RecordingCompensator {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Compensator for RecordingCompensator {
    async fn compensate(&self, operation: &Operation, _result: Option<&Value>) -> anyhow::Result<()> {
        self.calls.lock().push(operation.entity_id.clone());
        Ok(())
    }
}

// ========== Event Bus ==========

#[test]
fn test_handlers_run_in_registration_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let a = seen.clone();
    let b = seen.clone();
    let _s1 = bus.subscribe(move |_| a.lock().push("first"));
    let _s2 = bus.subscribe(move |_| b.lock().push("second"));
    bus.emit(&TransactionEvent::TransactionStart { transaction: Transaction::new(TransactionConfig::default()) });
    assert_eq!(*seen.lock(), vec!["first", "second"]);
}

#[test]
fn test_on_filters_by_kind() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _s = bus.on(EventKind::TransactionCancelled, move |_| { h.fetch_add(1, Ordering::SeqCst); });
    let tx = Transaction::new(TransactionConfig::default());
    bus.emit(&TransactionEvent::TransactionStart { transaction: tx.clone() });
    bus.emit(&TransactionEvent::TransactionCancelled { transaction: tx });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_subscription_unsubscribes() {
    let bus = EventBus::new();
    let s = bus.subscribe(|_| {});
    assert_eq!(bus.handler_count(), 1);
    drop(s);
    assert_eq!(bus.handler_count(), 0);

    bus.subscribe(|_| {}).detach();
    assert_eq!(bus.handler_count(), 1);
}

#[test]
fn test_panicking_handler_does_not_stop_others() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _bad = bus.subscribe(|_| panic!("handler bug"));
    let _good = bus.subscribe(move |_| { h.fetch_add(1, Ordering::SeqCst); });
    bus.emit(&TransactionEvent::TransactionStart { transaction: Transaction::new(TransactionConfig::default()) });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// ========== Manager Lifecycle ==========

#[test]
fn test_begin_returns_open_transaction() {
    let m = user_controlled();
    let starts = Arc::new(AtomicUsize::new(0));
    let s = starts.clone();
    let _sub = m.on(EventKind::TransactionStart, move |_| { s.fetch_add(1, Ordering::SeqCst); });
    let first = m.begin(None);
    let second = m.begin(None);
    assert_eq!(first, second);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(m.status(), Some(TransactionStatus::Pending));
}

#[test]
fn test_begin_with_override() {
    let m = user_controlled();
    m.begin(Some(&TransactionConfigOverride { require_confirmation: Some(true), ..Default::default() }));
    let tx = m.get_transaction().unwrap();
    assert!(tx.config.require_confirmation);
    assert!(!m.config().require_confirmation);
}

#[test]
fn test_add_operation_auto_begins() {
    let m = user_controlled();
    assert!(!m.has_transaction());
    let id = m.add_operation(ok_op("user", "temp-1")).unwrap();
    assert!(m.has_transaction());
    assert_eq!(m.get_operations()[0].id, id);
    assert!(m.can_commit());
    assert!(!m.has_scheduled_commit());
}

#[test]
fn test_disabled_manager_refuses_operations() {
    let mut cfg = TransactionConfig::default();
    cfg.enabled = false;
    let m = TransactionManager::new(cfg);
    assert!(matches!(m.add_operation(ok_op("user", "1")), Err(TxError::Disabled)));
}

#[test]
fn test_remove_operation() {
    let m = user_controlled();
    let removed = Arc::new(AtomicUsize::new(0));
    let r = removed.clone();
    let _sub = m.on(EventKind::OperationRemoved, move |_| { r.fetch_add(1, Ordering::SeqCst); });
    let a = m.add_operation(ok_op("user", "1")).unwrap();
    m.add_operation(ok_op("user", "2")).unwrap();
    assert!(m.remove_operation(&a));
    assert!(!m.remove_operation(&a));
    assert_eq!(m.get_operations().len(), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_summary_then_cancel() {
    let m = user_controlled();
    m.add_operation(NewOperation::create("user", "temp-1", json!({"id": "temp-1", "name": "Foo"}), Mutation::ready(json!(null))))
        .unwrap();
    let summary = m.get_summary();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.by_type, TypeCounts { create: 1, update: 0, delete: 0 });
    assert_eq!(summary.entity_types, vec!["user".to_string()]);

    assert!(m.cancel());
    assert!(m.get_operations().is_empty());
    assert_eq!(m.status(), None);
    assert_eq!(m.last_transaction().unwrap().status, TransactionStatus::Cancelled);
    assert!(!m.cancel());
}

#[test]
fn test_clear_is_silent() {
    let m = user_controlled();
    let events = Arc::new(AtomicUsize::new(0));
    let e = events.clone();
    m.add_operation(ok_op("user", "1")).unwrap();
    let _sub = m.subscribe(move |_| { e.fetch_add(1, Ordering::SeqCst); });
    assert!(m.clear());
    assert!(!m.has_transaction());
    assert_eq!(events.load(Ordering::SeqCst), 0);
}

#[test]
fn test_estimate_duration_is_linear() {
    let m = user_controlled();
    assert_eq!(m.estimate_duration(), Duration::from_millis(1000));
    m.add_operation(ok_op("user", "1")).unwrap();
    m.add_operation(ok_op("user", "2")).unwrap();
    assert_eq!(m.estimate_duration(), Duration::from_millis(2000));
}

// ========== Commit ==========

#[tokio::test]
async fn test_commit_without_transaction() {
    let m = user_controlled();
    assert!(matches!(m.commit(false).await, Err(TxError::NoActiveTransaction)));
}

#[tokio::test]
async fn test_commit_empty_transaction_completes() {
    let m = user_controlled();
    m.begin(None);
    let results = m.commit(false).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(m.last_transaction().unwrap().status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_require_confirmation_stops_at_review() {
    let mut cfg = TransactionConfig::with_mode(TransactionMode::UserControlled);
    cfg.require_confirmation = true;
    let m = TransactionManager::new(cfg);
    m.add_operation(ok_op("user", "1")).unwrap();

    let results = m.commit(false).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(m.status(), Some(TransactionStatus::Reviewing));
    assert!(!m.can_commit());
    assert!(m.has_operations());

    let results = m.commit(true).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(!m.has_transaction());
}

#[tokio::test]
async fn test_sequential_commit_preserves_order() {
    let m = TransactionManager::new(TransactionConfig {
        mode: TransactionMode::Immediate,
        auto_commit_delay_ms: 60_000,
        ..TransactionConfig::default()
    });
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4 {
        let order = order.clone();
        let id = i.to_string();
        let mutation = Mutation::new(move || {
            let order = order.clone();
            let id = id.clone();
            async move {
                order.lock().push(id.clone());
                Ok(json!({"id": id}))
            }
        });
        m.add_operation(NewOperation::create("user", i.to_string(), json!({}), mutation)).unwrap();
    }
    let results = m.commit(false).await.unwrap();
    assert!(results.iter().all(|r| r.success));
    assert_eq!(*order.lock(), vec!["0", "1", "2", "3"]);
}

#[tokio::test]
async fn test_operation_complete_fires_per_operation() {
    let m = user_controlled();
    let done = Arc::new(AtomicUsize::new(0));
    let completes = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    let c = completes.clone();
    let _s1 = m.on(EventKind::OperationComplete, move |_| { d.fetch_add(1, Ordering::SeqCst); });
    let _s2 = m.on(EventKind::TransactionComplete, move |e| {
        if let TransactionEvent::TransactionComplete { results, .. } = e {
            assert_eq!(results.len(), 3);
        }
        c.fetch_add(1, Ordering::SeqCst);
    });
    for i in 0..3 {
        m.add_operation(ok_op("user", &i.to_string())).unwrap();
    }
    m.commit(false).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(completes.load(Ordering::SeqCst), 1);
    let last = m.last_transaction().unwrap();
    assert_eq!(last.results.len(), 3);
    assert!(last.completed_at.is_some());
}

#[tokio::test]
async fn test_batch_failure_rolls_back_successes() {
    let compensator = Arc::new(RecordingCompensator::default());
    let m = TransactionManager::builder()
        .config(TransactionConfig::with_mode(TransactionMode::UserControlled))
        .compensator(compensator.clone())
        .build();
    m.add_operation(ok_op("user", "a")).unwrap();
    m.add_operation(failing_op("b", "boom")).unwrap();
    m.add_operation(ok_op("user", "c")).unwrap();

    let err = m.commit(false).await.unwrap_err();
    assert!(matches!(err, TxError::TransactionRolledBack { .. }));
    assert_eq!(err.failure_count(), 1);
    assert!(err.to_string().contains("boom"));

    let mut calls = compensator.calls.lock().clone();
    calls.sort();
    assert_eq!(calls, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(m.last_transaction().unwrap().status, TransactionStatus::RolledBack);
    assert!(!m.has_transaction());
}

#[tokio::test]
async fn test_explicit_rollback_preferred_over_compensator() {
    let compensator = Arc::new(RecordingCompensator::default());
    let undone = Arc::new(AtomicUsize::new(0));
    let u = undone.clone();
    let m = TransactionManager::builder()
        .config(TransactionConfig::with_mode(TransactionMode::UserControlled))
        .compensator(compensator.clone())
        .build();
    let undo = Mutation::new(move || {
        let u = u.clone();
        async move {
            u.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });
    m.add_operation(ok_op("user", "a").rollback(undo)).unwrap();
    m.add_operation(failing_op("b", "nope")).unwrap();
    assert!(m.commit(false).await.is_err());
    assert_eq!(undone.load(Ordering::SeqCst), 1);
    assert!(compensator.calls.lock().is_empty());
}

#[tokio::test]
async fn test_failed_compensation_marks_transaction_failed() {
    let m = user_controlled();
    let broken_undo = Mutation::new(|| async { Err::<Value, _>(anyhow::anyhow!("undo broke")) });
    m.add_operation(ok_op("user", "a").rollback(broken_undo)).unwrap();
    m.add_operation(ok_op("user", "b")).unwrap();
    m.add_operation(failing_op("c", "boom")).unwrap();

    let rollbacks = Arc::new(Mutex::new(None));
    let r = rollbacks.clone();
    let _sub = m.on(EventKind::RollbackComplete, move |e| {
        if let TransactionEvent::RollbackComplete { failed, rolled_back, .. } = e {
            *r.lock() = Some((*failed, rolled_back.len()));
        }
    });

    let err = m.commit(false).await.unwrap_err();
    assert!(matches!(err, TxError::RollbackIncomplete { failed_compensations: 1, .. }));
    assert!(err.is_rollback());
    // "b" has no compensating action at all and is skipped.
    assert_eq!(*rollbacks.lock(), Some((1, 0)));
    assert_eq!(m.last_transaction().unwrap().status, TransactionStatus::Failed);
}

#[tokio::test]
async fn test_batch_reports_failure_count() {
    let m = user_controlled();
    m.add_operation(failing_op("a", "x")).unwrap();
    m.add_operation(failing_op("b", "y")).unwrap();
    m.add_operation(ok_op("user", "c")).unwrap();
    let err = m.commit(false).await.unwrap_err();
    assert_eq!(err.failure_count(), 2);
    match err {
        TxError::TransactionRolledBack { source, .. } => {
            assert!(matches!(*source, TxError::BatchFailed { failed: 2, total: 3, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_operations_refused_while_executing() {
    let m = user_controlled();
    let slow = Mutation::new(|| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    m.add_operation(NewOperation::create("user", "1", json!({}), slow)).unwrap();

    let runner = m.clone();
    let commit = tokio::spawn(async move { runner.commit(false).await });
    tokio::task::yield_now().await;

    assert_eq!(m.status(), Some(TransactionStatus::Executing));
    assert!(matches!(m.add_operation(ok_op("user", "2")), Err(TxError::CommitInProgress { .. })));
    assert!(!m.cancel());
    assert!(matches!(m.commit(true).await, Err(TxError::CommitInProgress { .. })));

    let results = commit.await.unwrap().unwrap();
    assert_eq!(results.len(), 1);
}

// ========== Auto-commit ==========

#[tokio::test(start_paused = true)]
async fn test_auto_commit_batches_near_simultaneous_additions() {
    let mut cfg = TransactionConfig::default();
    cfg.auto_commit = true;
    let m = TransactionManager::new(cfg);
    m.add_operation(ok_op("user", "1")).unwrap();
    m.add_operation(ok_op("user", "2")).unwrap();
    assert!(m.has_scheduled_commit());

    let results = m.wait_for_auto_commit().await.unwrap().unwrap();
    assert_eq!(results.len(), 2);
    assert!(m.wait_for_auto_commit().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pending_ceiling_forces_commit() {
    let mut cfg = TransactionConfig::default();
    cfg.max_pending_operations = Some(2);
    let m = TransactionManager::new(cfg);
    m.add_operation(ok_op("user", "1")).unwrap();
    assert!(!m.has_scheduled_commit());
    m.add_operation(ok_op("user", "2")).unwrap();
    assert!(m.has_scheduled_commit());
    let results = m.wait_for_auto_commit().await.unwrap().unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_aborts_scheduled_commit() {
    let mut cfg = TransactionConfig::default();
    cfg.auto_commit = true;
    let m = TransactionManager::new(cfg);
    m.add_operation(ok_op("user", "1")).unwrap();
    assert!(m.cancel());
    assert!(!m.has_scheduled_commit());
    assert!(m.wait_for_auto_commit().await.is_none());
    assert_eq!(m.last_transaction().unwrap().status, TransactionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_clear_drops_pending_timer() {
    let mut cfg = TransactionConfig::default();
    cfg.auto_commit = true;
    let m = TransactionManager::new(cfg);
    m.add_operation(ok_op("user", "a")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(m.clear());
    assert!(!m.has_scheduled_commit());

    tokio::time::sleep(Duration::from_millis(10)).await;
    m.add_operation(ok_op("user", "b")).unwrap();

    // Past the first window, inside the second.
    tokio::time::sleep(Duration::from_millis(45)).await;
    assert!(m.has_transaction());
    assert_eq!(m.status(), Some(TransactionStatus::Pending));
    assert!(m.last_transaction().is_none());

    let results = m.wait_for_auto_commit().await.unwrap().unwrap();
    assert_eq!(results.len(), 1);
    let last = m.last_transaction().unwrap();
    assert_eq!(last.status, TransactionStatus::Completed);
    assert_eq!(last.operations[0].entity_id, "b");
}
