//! Headless render contract. Painting is left to the host UI.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::filter::FilterField;
use crate::query::FilterValue;
use crate::view::{PageView, RowView};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub field: String,
    pub header: String,
    #[serde(default)]
    pub sortable: bool,
}

impl ColumnDescriptor {
    pub fn new(field: impl Into<String>, header: impl Into<String>) -> Self {
        Self { field: field.into(), header: header.into(), sortable: false }
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }
}

/// Per-row action button (edit, delete, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowAction {
    pub id: String,
    pub label: String,
}

impl RowAction {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self { id: id.into(), label: label.into() }
    }
}

/// Selected row ids, the input of bulk actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ids: BTreeSet<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.ids.remove(&id) {
            false
        } else {
            self.ids.insert(id);
            true
        }
    }

    /// Select every visible row that is not a temporary (unsaved) one.
    pub fn select_page(&mut self, page: &PageView) {
        self.ids.extend(
            page.rows
                .iter()
                .filter(|r| !r.temporary)
                .filter_map(|r| r.id.clone()),
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

pub trait TableRenderer {
    fn render_table(
        &mut self,
        rows: &[RowView],
        total: usize,
        columns: &[ColumnDescriptor],
        actions: &[RowAction],
        selection: &Selection,
    );
}

pub trait FormRenderer {
    /// `initial` is an empty object when creating.
    fn render_form(&mut self, fields: &[FilterField], initial: &Value);
}

pub trait FilterRenderer {
    fn render_filters(&mut self, fields: &[FilterField], values: &BTreeMap<String, FilterValue>);
}
