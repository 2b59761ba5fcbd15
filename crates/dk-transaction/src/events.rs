//! Typed lifecycle events with RAII subscriptions.

use dk_core::{Operation, Transaction, TransactionResult};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransactionStart,
    OperationAdded,
    OperationRemoved,
    OperationComplete,
    TransactionComplete,
    TransactionError,
    TransactionCancelled,
    RollbackComplete,
}

#[derive(Debug, Clone)]
pub enum TransactionEvent {
    TransactionStart {
        transaction: Transaction,
    },
    OperationAdded {
        transaction_id: String,
        operation: Operation,
    },
    OperationRemoved {
        transaction_id: String,
        operation: Operation,
    },
    /// Fired once per executed operation, success or failure.
    OperationComplete {
        transaction_id: String,
        result: TransactionResult,
    },
    TransactionComplete {
        transaction: Transaction,
        results: Vec<TransactionResult>,
    },
    TransactionError {
        transaction: Transaction,
        error: String,
    },
    TransactionCancelled {
        transaction: Transaction,
    },
    RollbackComplete {
        transaction: Transaction,
        rolled_back: Vec<Operation>,
        failed: usize,
    },
}

impl TransactionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TransactionStart { .. } => EventKind::TransactionStart,
            Self::OperationAdded { .. } => EventKind::OperationAdded,
            Self::OperationRemoved { .. } => EventKind::OperationRemoved,
            Self::OperationComplete { .. } => EventKind::OperationComplete,
            Self::TransactionComplete { .. } => EventKind::TransactionComplete,
            Self::TransactionError { .. } => EventKind::TransactionError,
            Self::TransactionCancelled { .. } => EventKind::TransactionCancelled,
            Self::RollbackComplete { .. } => EventKind::RollbackComplete,
        }
    }

    /// Transaction the event belongs to.
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::OperationAdded { transaction_id, .. }
            | Self::OperationRemoved { transaction_id, .. }
            | Self::OperationComplete { transaction_id, .. } => transaction_id,
            Self::TransactionStart { transaction }
            | Self::TransactionComplete { transaction, .. }
            | Self::TransactionError { transaction, .. }
            | Self::TransactionCancelled { transaction }
            | Self::RollbackComplete { transaction, .. } => &transaction.id,
        }
    }
}

pub type Handler = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

struct Slot {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    slots: Vec<Slot>,
}

/// Publish/subscribe hub owned by a transaction manager.
#[derive(Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(&self, handler: impl Fn(&TransactionEvent) + Send + Sync + 'static) -> Subscription {
        self.insert(None, Arc::new(handler))
    }

    /// Receive events of one kind.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&TransactionEvent) + Send + Sync + 'static) -> Subscription {
        self.insert(Some(kind), Arc::new(handler))
    }

    fn insert(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.slots.push(Slot { id, kind, handler });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Invoke matching handlers in registration order.
    ///
    /// Handlers run without the bus lock held, so they may subscribe,
    /// unsubscribe or call back into the manager. A panicking handler is
    /// logged and does not stop the others.
    pub fn emit(&self, event: &TransactionEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(?kind, tx = event.transaction_id(), "transaction event handler panicked");
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

/// Keeps a handler registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the handler for as long as the bus lives.
    pub fn detach(mut self) {
        self.bus = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().slots.retain(|s| s.id != self.id);
        }
    }
}
