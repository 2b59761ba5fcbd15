use serde::Serialize;

use crate::operation::{Operation, OperationTrigger, OperationType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl TypeCounts {
    fn bump(&mut self, op_type: OperationType) {
        match op_type {
            OperationType::Create => self.create += 1,
            OperationType::Update => self.update += 1,
            OperationType::Delete => self.delete += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCounts {
    pub user_edit: usize,
    pub bulk_action: usize,
    pub row_action: usize,
}

impl TriggerCounts {
    fn bump(&mut self, trigger: OperationTrigger) {
        match trigger {
            OperationTrigger::UserEdit => self.user_edit += 1,
            OperationTrigger::BulkAction => self.bulk_action += 1,
            OperationTrigger::RowAction => self.row_action += 1,
        }
    }
}

/// Counts of pending operations, grouped by type and by trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub total: usize,
    pub by_type: TypeCounts,
    pub by_trigger: TriggerCounts,
    /// Distinct entity kinds for a single manager; concatenated when merged.
    pub entity_types: Vec<String>,
}

impl TransactionSummary {
    pub fn from_operations(operations: &[Operation]) -> Self {
        let mut summary = Self::default();
        for op in operations {
            summary.total += 1;
            summary.by_type.bump(op.op_type);
            summary.by_trigger.bump(op.trigger);
            if !summary.entity_types.contains(&op.entity_type) {
                summary.entity_types.push(op.entity_type.clone());
            }
        }
        summary
    }

    /// Add another summary into this one. Entity kinds are appended as-is.
    pub fn merge(&mut self, other: &TransactionSummary) {
        self.total += other.total;
        self.by_type.create += other.by_type.create;
        self.by_type.update += other.by_type.update;
        self.by_type.delete += other.by_type.delete;
        self.by_trigger.user_edit += other.by_trigger.user_edit;
        self.by_trigger.bulk_action += other.by_trigger.bulk_action;
        self.by_trigger.row_action += other.by_trigger.row_action;
        self.entity_types.extend(other.entity_types.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}
