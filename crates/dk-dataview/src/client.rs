//! REST-like CRUD contract and the compensating actions built on it.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dk_core::{Operation, OperationType};
use dk_transaction::Compensator;
use serde_json::Value;
use std::sync::Arc;

use crate::overlay::row_id;
use crate::query::QueryParams;

#[async_trait]
pub trait CrudClient: Send + Sync {
    /// Fetch one page; the response shape is whatever the adapter understands.
    async fn list(&self, resource: &str, params: &QueryParams) -> anyhow::Result<Value>;
    /// Create an entity and return the server's copy.
    async fn create(&self, resource: &str, entity: &Value) -> anyhow::Result<Value>;
    async fn update(&self, resource: &str, id: &str, changes: &Value) -> anyhow::Result<Value>;
    async fn delete(&self, resource: &str, id: &str) -> anyhow::Result<Value>;
}

/// Undo committed operations through the same client that applied them.
pub struct ClientCompensator {
    client: Arc<dyn CrudClient>,
    id_field: String,
}

impl ClientCompensator {
    pub fn new(client: Arc<dyn CrudClient>, id_field: impl Into<String>) -> Self {
        Self { client, id_field: id_field.into() }
    }
}

#[async_trait]
impl Compensator for ClientCompensator {
    async fn compensate(&self, operation: &Operation, result: Option<&Value>) -> anyhow::Result<()> {
        let resource = operation.entity_type.as_str();
        match operation.op_type {
            OperationType::Create => {
                // The server assigned the real id; the operation only knows the temporary one.
                let id = result
                    .and_then(|r| row_id(r, &self.id_field))
                    .ok_or_else(|| anyhow!("created {} has no {} in its response", resource, self.id_field))?;
                self.client.delete(resource, &id).await.map(|_| ())
            }
            OperationType::Update => {
                let original = operation
                    .original_data
                    .as_ref()
                    .context("update has no original data to restore")?;
                self.client
                    .update(resource, &operation.entity_id, original)
                    .await
                    .map(|_| ())
            }
            OperationType::Delete => {
                let original = operation
                    .original_data
                    .as_ref()
                    .context("delete has no original data to recreate")?;
                self.client.create(resource, original).await.map(|_| ())
            }
        }
    }
}
