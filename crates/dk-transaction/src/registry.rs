//! Registry of transaction managers driven from one control surface.
//!
//! Each data view registers its manager while it is alive; a toolbar can then
//! commit or cancel everything without knowing the views.

use dk_core::TransactionSummary;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::manager::TransactionManager;

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    managers: RwLock<HashMap<String, Arc<TransactionManager>>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: Mutex<u64>,
}

/// Outcome of [`TransactionRegistry::commit_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitAllReport {
    pub committed: Vec<String>,
    /// Manager id and error text for every partial commit failure.
    pub failed: Vec<(String, String)>,
}

impl CommitAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cheap-to-clone handle to a shared registry.
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    inner: Arc<RegistryInner>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` under `id`. A second registration of the same id is a
    /// no-op, and so is dropping the guard it returns.
    pub fn register(&self, id: impl Into<String>, manager: Arc<TransactionManager>) -> Registration {
        let id = id.into();
        let weak = Arc::downgrade(&manager);
        let inserted = {
            let mut managers = self.inner.managers.write();
            if managers.contains_key(&id) {
                false
            } else {
                managers.insert(id.clone(), manager);
                true
            }
        };
        if inserted {
            tracing::debug!(manager = %id, "transaction manager registered");
            self.notify();
        }
        Registration {
            registry: Arc::downgrade(&self.inner),
            id,
            manager: weak,
            owned: inserted,
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        unregister_inner(&self.inner, id)
    }

    pub fn get_manager(&self, id: &str) -> Option<Arc<TransactionManager>> {
        self.inner.managers.read().get(id).cloned()
    }

    pub fn get_all_managers(&self) -> Vec<Arc<TransactionManager>> {
        self.inner.managers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending(&self) -> bool {
        self.get_all_managers().iter().any(|m| m.has_operations())
    }

    pub fn get_combined_summary(&self) -> TransactionSummary {
        let mut combined = TransactionSummary::default();
        for manager in self.get_all_managers() {
            combined.merge(&manager.get_summary());
        }
        combined
    }

    /// Force-commit every manager that can commit.
    ///
    /// A failing manager is logged and recorded; the others still commit.
    pub async fn commit_all(&self) -> CommitAllReport {
        let mut report = CommitAllReport::default();
        for manager in self.get_all_managers() {
            if !manager.can_commit() {
                continue;
            }
            match manager.commit(true).await {
                Ok(_) => report.committed.push(manager.id().to_string()),
                Err(e) => {
                    tracing::error!(manager = manager.id(), error = %e, "partial commit failure");
                    report.failed.push((manager.id().to_string(), e.to_string()));
                }
            }
        }
        self.notify();
        report
    }

    /// Cancel every manager with pending operations.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for manager in self.get_all_managers() {
            if manager.has_operations() && manager.cancel() {
                cancelled += 1;
            }
        }
        self.notify();
        cancelled
    }

    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerHandle {
        let id = {
            let mut next = self.inner.next_listener.lock();
            *next += 1;
            *next
        };
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        ListenerHandle {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn notify(&self) {
        notify_inner(&self.inner);
    }
}

fn notify_inner(inner: &RegistryInner) {
    let listeners: Vec<Listener> = inner.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
            tracing::error!("registry listener panicked");
        }
    }
}

fn unregister_inner(inner: &RegistryInner, id: &str) -> bool {
    let removed = inner.managers.write().remove(id).is_some();
    if removed {
        tracing::debug!(manager = id, "transaction manager unregistered");
        notify_inner(inner);
    }
    removed
}

/// Keeps a manager registered; dropping it unregisters when this guard did
/// the registering.
#[must_use = "dropping a Registration unregisters the manager"]
pub struct Registration {
    registry: Weak<RegistryInner>,
    id: String,
    manager: Weak<TransactionManager>,
    owned: bool,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this guard inserted the manager (and will remove it).
    pub fn is_owner(&self) -> bool {
        self.owned
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let Some(inner) = self.registry.upgrade() else { return };
        // The id may have been unregistered and taken by another manager since.
        let ours = {
            let mut managers = inner.managers.write();
            let ours = match (managers.get(&self.id), self.manager.upgrade()) {
                (Some(current), Some(mine)) => Arc::ptr_eq(current, &mine),
                _ => false,
            };
            if ours {
                managers.remove(&self.id);
            }
            ours
        };
        if ours {
            tracing::debug!(manager = %self.id, "transaction manager unregistered");
            notify_inner(&inner);
        }
    }
}

#[must_use = "dropping a ListenerHandle removes the listener"]
pub struct ListenerHandle {
    registry: Weak<RegistryInner>,
    id: u64,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
