//! Registry fan-out: many managers, one control surface.

use dk_core::{Mutation, NewOperation, TransactionConfig, TransactionMode, TransactionStatus};
use dk_transaction::{TransactionManager, TransactionRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn manager(id: &str) -> Arc<TransactionManager> {
    TransactionManager::builder()
        .id(id)
        .config(TransactionConfig::with_mode(TransactionMode::UserControlled))
        .build()
}

fn op(entity_type: &str, id: &str) -> NewOperation {
    NewOperation::create(entity_type, id, json!({"id": id}), Mutation::ready(json!({"id": id})))
}

fn counter(registry: &TransactionRegistry) -> (Arc<AtomicUsize>, dk_transaction::ListenerHandle) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handle = registry.add_listener(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    (hits, handle)
}

#[test]
fn test_register_is_idempotent() {
    let registry = TransactionRegistry::new();
    let (hits, _l) = counter(&registry);
    let m = manager("users");

    let first = registry.register("users", m.clone());
    let second = registry.register("users", m.clone());
    assert!(first.is_owner());
    assert!(!second.is_owner());
    assert_eq!(registry.get_all_managers().len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Dropping the non-owning guard leaves the manager in place.
    drop(second);
    assert_eq!(registry.len(), 1);
    drop(first);
    assert!(registry.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unregister_is_idempotent() {
    let registry = TransactionRegistry::new();
    let (hits, _l) = counter(&registry);
    let _reg = registry.register("orders", manager("orders"));
    assert!(registry.unregister("orders"));
    assert!(!registry.unregister("orders"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_stale_registration_keeps_newer_manager() {
    let registry = TransactionRegistry::new();
    let stale = registry.register("users", manager("users"));
    assert!(registry.unregister("users"));

    let newer = manager("users");
    let _current = registry.register("users", newer.clone());
    drop(stale);

    let registered = registry.get_manager("users").unwrap();
    assert!(Arc::ptr_eq(&registered, &newer));
}

#[test]
fn test_stale_registration_with_live_manager_keeps_newer_manager() {
    let registry = TransactionRegistry::new();
    let first = manager("users");
    let stale = registry.register("users", first.clone());
    registry.unregister("users");

    let newer = manager("users");
    let _current = registry.register("users", newer.clone());
    drop(stale);

    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.get_manager("users").unwrap(), &newer));
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_fan_out() {
    let registry = TransactionRegistry::new();
    let _bad = registry.add_listener(|| panic!("listener failure"));
    let (hits, _l) = counter(&registry);

    let m = manager("users");
    let _reg = registry.register("users", m.clone());
    m.add_operation(op("user", "1")).unwrap();
    assert_eq!(registry.cancel_all(), 1);

    m.add_operation(op("user", "2")).unwrap();
    let report = registry.commit_all().await;
    assert_eq!(report.committed, vec!["users".to_string()]);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn test_listener_handle_removes_listener() {
    let registry = TransactionRegistry::new();
    let (hits, handle) = counter(&registry);
    drop(handle);
    let _reg = registry.register("a", manager("a"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_combined_summary_and_cancel_all() {
    let registry = TransactionRegistry::new();
    let a = manager("a");
    let b = manager("b");
    let _ra = registry.register("a", a.clone());
    let _rb = registry.register("b", b.clone());
    a.add_operation(op("user", "1")).unwrap();
    a.add_operation(op("user", "2")).unwrap();

    let summary = registry.get_combined_summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.by_type.create, 2);
    assert!(registry.has_pending());

    let (hits, _l) = counter(&registry);
    assert_eq!(registry.cancel_all(), 1);
    assert!(a.get_operations().is_empty());
    assert!(b.last_transaction().is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_combined_entity_types_not_deduplicated() {
    let registry = TransactionRegistry::new();
    let a = manager("a");
    let b = manager("b");
    let _ra = registry.register("a", a.clone());
    let _rb = registry.register("b", b.clone());
    a.add_operation(op("user", "1")).unwrap();
    b.add_operation(op("user", "2")).unwrap();
    let summary = registry.get_combined_summary();
    assert_eq!(summary.entity_types, vec!["user".to_string(), "user".to_string()]);
}

#[tokio::test]
async fn test_commit_all_tolerates_partial_failure() {
    let registry = TransactionRegistry::new();
    let good = manager("good");
    let bad = manager("bad");
    let idle = manager("idle");
    let _r1 = registry.register("good", good.clone());
    let _r2 = registry.register("bad", bad.clone());
    let _r3 = registry.register("idle", idle.clone());

    good.add_operation(op("user", "1")).unwrap();
    bad.add_operation(NewOperation::update("order", "9", json!({}), json!({}), Mutation::new(|| async {
        Err::<Value, _>(anyhow::anyhow!("server said no"))
    })))
    .unwrap();

    let (hits, _l) = counter(&registry);
    let report = registry.commit_all().await;
    assert_eq!(report.committed, vec!["good".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad");
    assert!(report.failed[0].1.contains("server said no"));
    assert!(!report.is_clean());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(good.last_transaction().unwrap().status, TransactionStatus::Completed);
    assert_eq!(bad.last_transaction().unwrap().status, TransactionStatus::RolledBack);
    assert!(idle.last_transaction().is_none());
}

#[tokio::test]
async fn test_commit_all_forces_past_review() {
    let registry = TransactionRegistry::new();
    let mut cfg = TransactionConfig::with_mode(TransactionMode::UserControlled);
    cfg.require_confirmation = true;
    let m = TransactionManager::builder().id("review").config(cfg).build();
    let _r = registry.register("review", m.clone());
    m.add_operation(op("user", "1")).unwrap();

    let report = registry.commit_all().await;
    assert_eq!(report.committed, vec!["review".to_string()]);
    assert!(!m.has_transaction());
}
