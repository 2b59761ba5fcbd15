use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of change an operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// Where an operation came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationTrigger {
    #[default]
    UserEdit,
    BulkAction,
    RowAction,
}

pub type MutationFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Deferred async action, usually the network call behind an operation.
///
/// Cloning shares the closure; every `call` starts a fresh future.
#[derive(Clone)]
pub struct Mutation(Arc<dyn Fn() -> MutationFuture + Send + Sync>);

impl Mutation {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    /// A mutation that succeeds at once with `value`.
    pub fn ready(value: Value) -> Self {
        Self::new(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub fn call(&self) -> MutationFuture {
        (self.0)()
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mutation(..)")
    }
}

/// One pending create/update/delete against one entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub trigger: OperationTrigger,
    pub entity_type: String,
    /// Entity value after the operation.
    pub entity: Value,
    pub entity_id: String,
    /// Snapshot before the operation; drives compensation.
    pub original_data: Option<Value>,
    pub changed_fields: Option<Vec<String>>,
    pub label: String,
    pub color: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub mutation: Mutation,
    #[serde(skip)]
    pub rollback: Option<Mutation>,
}

/// Fresh `op_`-prefixed operation id.
pub fn new_operation_id() -> String {
    format!("op_{}", Uuid::new_v4().simple())
}

/// An operation as the caller describes it, before the manager stamps it.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub id: Option<String>,
    pub op_type: OperationType,
    pub trigger: OperationTrigger,
    pub entity_type: String,
    pub entity: Value,
    pub entity_id: String,
    pub original_data: Option<Value>,
    pub changed_fields: Option<Vec<String>>,
    pub label: Option<String>,
    pub color: Option<String>,
    pub mutation: Mutation,
    pub rollback: Option<Mutation>,
}

impl NewOperation {
    fn base(
        op_type: OperationType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        entity: Value,
        mutation: Mutation,
    ) -> Self {
        Self {
            id: None,
            op_type,
            trigger: OperationTrigger::UserEdit,
            entity_type: entity_type.into(),
            entity,
            entity_id: entity_id.into(),
            original_data: None,
            changed_fields: None,
            label: None,
            color: None,
            mutation,
            rollback: None,
        }
    }

    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        entity: Value,
        mutation: Mutation,
    ) -> Self {
        Self::base(OperationType::Create, entity_type, entity_id, entity, mutation)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        entity: Value,
        original: Value,
        mutation: Mutation,
    ) -> Self {
        let mut op = Self::base(OperationType::Update, entity_type, entity_id, entity, mutation);
        op.original_data = Some(original);
        op
    }

    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        original: Value,
        mutation: Mutation,
    ) -> Self {
        let mut op = Self::base(OperationType::Delete, entity_type, entity_id, original.clone(), mutation);
        op.original_data = Some(original);
        op
    }

    /// Fix the operation id ahead of queueing, so callers can tag local
    /// state before the manager can commit it.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn trigger(mut self, trigger: OperationTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = Some(fields);
        self
    }

    /// Explicit compensating action, preferred over any manager-level compensator.
    pub fn rollback(mut self, rollback: Mutation) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Stamp id and timestamp.
    pub fn into_operation(self) -> Operation {
        let label = self.label.unwrap_or_else(|| match self.op_type {
            OperationType::Create => format!("Create {}", self.entity_type),
            OperationType::Update => format!("Update {} {}", self.entity_type, self.entity_id),
            OperationType::Delete => format!("Delete {} {}", self.entity_type, self.entity_id),
        });
        let color = self.color.unwrap_or_else(|| {
            match self.op_type {
                OperationType::Create => "success",
                OperationType::Update => "info",
                OperationType::Delete => "error",
            }
            .to_string()
        });
        Operation {
            id: self.id.unwrap_or_else(new_operation_id),
            op_type: self.op_type,
            trigger: self.trigger,
            entity_type: self.entity_type,
            entity: self.entity,
            entity_id: self.entity_id,
            original_data: self.original_data,
            changed_fields: self.changed_fields,
            label,
            color,
            timestamp: Utc::now(),
            mutation: self.mutation,
            rollback: self.rollback,
        }
    }
}
