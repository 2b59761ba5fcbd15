//! Declarative filter fields rendered as form controls by a host UI.

use serde::{Deserialize, Serialize};

use crate::error::{DataViewError, Result};
use crate::query::{FilterValue, QueryParams};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOption {
    pub value: String,
    pub label: String,
}

impl FilterOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self { value: value.into(), label: label.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FilterKind {
    Text,
    Select { options: Vec<FilterOption> },
    MultiSelect { options: Vec<FilterOption> },
    Boolean,
    Number,
    DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterField {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FilterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl FilterField {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: FilterKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            placeholder: None,
        }
    }

    pub fn text(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, FilterKind::Text)
    }

    pub fn select(name: impl Into<String>, label: impl Into<String>, options: Vec<FilterOption>) -> Self {
        Self::new(name, label, FilterKind::Select { options })
    }

    pub fn boolean(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, FilterKind::Boolean)
    }

    pub fn placeholder(mut self, text: impl Into<String>) -> Self {
        self.placeholder = Some(text.into());
        self
    }

    /// Whether `value` fits this control. Empty values always fit (they clear).
    pub fn accepts(&self, value: &FilterValue) -> bool {
        if value.is_empty() {
            return true;
        }
        let known = |options: &[FilterOption], v: &str| options.iter().any(|o| o.value == v);
        match (&self.kind, value) {
            (FilterKind::Text, FilterValue::Text(_)) => true,
            (FilterKind::Select { options }, FilterValue::Text(v)) => known(options, v),
            (FilterKind::MultiSelect { options }, FilterValue::Many(vs)) => vs.iter().all(|v| known(options, v)),
            (FilterKind::Boolean, FilterValue::Bool(_)) => true,
            (FilterKind::Number, FilterValue::Number(_)) => true,
            (FilterKind::DateRange, FilterValue::Range { .. }) => true,
            _ => false,
        }
    }
}

/// Validate `name = value` against the declared fields and apply it to `params`.
///
/// With no declared fields every filter is accepted.
pub fn apply_filter(
    params: &mut QueryParams,
    fields: &[FilterField],
    name: &str,
    value: FilterValue,
) -> Result<()> {
    if !fields.is_empty() {
        let field = fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DataViewError::UnknownFilter(name.to_string()))?;
        if !field.accepts(&value) {
            return Err(DataViewError::InvalidFilterValue(name.to_string()));
        }
    }
    params.set_filter(name, value);
    Ok(())
}
