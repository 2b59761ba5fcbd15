//! Transaction coordination for dashkit data views.
//!
//! A [`TransactionManager`] batches create/update/delete operations and runs
//! them with rollback on failure; a [`TransactionRegistry`] drives many
//! managers from one commit-all / cancel-all control surface.

pub mod events;
pub mod manager;
pub mod registry;
pub mod rollback;

pub use events::{EventBus, EventKind, Subscription, TransactionEvent};
pub use manager::{ManagerBuilder, TransactionManager};
pub use registry::{CommitAllReport, ListenerHandle, Registration, TransactionRegistry};
pub use rollback::{Compensator, RollbackOutcome};

#[cfg(test)]
mod tests;
