use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::operation::OperationTrigger;

/// Auto-commit regime of a transaction manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionMode {
    /// Every addition commits on its own.
    Immediate,
    /// Operations accumulate; commit follows `auto_commit` or the pending ceiling.
    #[default]
    Batch,
    /// Only bulk actions may auto-commit.
    BulkOnly,
    /// Bulk actions and other triggers follow separate switches.
    Hybrid,
    /// Never auto-commit.
    UserControlled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionConfig {
    pub enabled: bool,
    pub mode: TransactionMode,
    pub auto_commit: bool,
    pub bulk_auto_commit: Option<bool>,
    pub require_confirmation: bool,
    pub max_pending_operations: Option<usize>,
    pub show_pending_indicator: bool,
    pub show_review_ui: bool,
    /// Batching window before a scheduled auto-commit runs.
    pub auto_commit_delay_ms: u64,
    pub operation_cost_ms: u64,
    pub overhead_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TransactionMode::Batch,
            auto_commit: false,
            bulk_auto_commit: None,
            require_confirmation: false,
            max_pending_operations: None,
            show_pending_indicator: true,
            show_review_ui: false,
            auto_commit_delay_ms: 100,
            operation_cost_ms: 500,
            overhead_ms: 1000,
        }
    }
}

impl TransactionConfig {
    pub fn with_mode(mode: TransactionMode) -> Self {
        Self { mode, ..Self::default() }
    }

    /// Decide whether adding an operation with `trigger` should schedule a commit,
    /// given `pending` operations now in the transaction (including the new one).
    pub fn should_auto_commit(&self, trigger: OperationTrigger, pending: usize) -> bool {
        let bulk = trigger == OperationTrigger::BulkAction;
        match self.mode {
            TransactionMode::Immediate => true,
            TransactionMode::BulkOnly => bulk && self.bulk_auto_commit.unwrap_or(self.auto_commit),
            TransactionMode::Hybrid => {
                if bulk {
                    self.bulk_auto_commit.unwrap_or(false)
                } else {
                    self.auto_commit
                }
            }
            TransactionMode::UserControlled => false,
            TransactionMode::Batch => match self.max_pending_operations {
                Some(max) if pending >= max => true,
                _ => self.auto_commit,
            },
        }
    }

    /// Executes operations one by one instead of as a concurrent batch.
    pub fn is_sequential(&self) -> bool {
        self.mode == TransactionMode::Immediate
    }

    pub fn merged(&self, patch: &TransactionConfigOverride) -> Self {
        let mut cfg = self.clone();
        if let Some(v) = patch.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = patch.mode {
            cfg.mode = v;
        }
        if let Some(v) = patch.auto_commit {
            cfg.auto_commit = v;
        }
        if let Some(v) = patch.bulk_auto_commit {
            cfg.bulk_auto_commit = Some(v);
        }
        if let Some(v) = patch.require_confirmation {
            cfg.require_confirmation = v;
        }
        if let Some(v) = patch.max_pending_operations {
            cfg.max_pending_operations = Some(v);
        }
        if let Some(v) = patch.auto_commit_delay_ms {
            cfg.auto_commit_delay_ms = v;
        }
        cfg
    }
}

/// Per-transaction adjustments passed to `begin`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionConfigOverride {
    pub enabled: Option<bool>,
    pub mode: Option<TransactionMode>,
    pub auto_commit: Option<bool>,
    pub bulk_auto_commit: Option<bool>,
    pub require_confirmation: Option<bool>,
    pub max_pending_operations: Option<usize>,
    pub auto_commit_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataViewConfig {
    pub page_size: usize,
    /// Row field holding the entity id.
    pub id_field: String,
    /// Patch the cache before the server answers.
    pub optimistic: bool,
}

impl Default for DataViewConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            id_field: "id".into(),
            optimistic: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashkitConfig {
    pub transaction: TransactionConfig,
    pub data_view: DataViewConfig,
}

impl DashkitConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
