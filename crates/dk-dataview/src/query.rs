//! Query parameters and the cache key they form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// Current value of one filter control.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Number(i64),
    Text(String),
    Many(Vec<String>),
    Range {
        from: Option<String>,
        to: Option<String>,
    },
}

impl FilterValue {
    /// An empty value means "no filter".
    pub fn is_empty(&self) -> bool {
        match self {
            FilterValue::Text(s) => s.trim().is_empty(),
            FilterValue::Many(v) => v.is_empty(),
            FilterValue::Range { from, to } => from.is_none() && to.is_none(),
            FilterValue::Bool(_) | FilterValue::Number(_) => false,
        }
    }

    fn push_pairs(&self, name: &str, out: &mut Vec<(String, String)>) {
        match self {
            FilterValue::Bool(b) => out.push((name.to_string(), b.to_string())),
            FilterValue::Number(n) => out.push((name.to_string(), n.to_string())),
            FilterValue::Text(s) => out.push((name.to_string(), s.clone())),
            FilterValue::Many(values) => out.push((name.to_string(), values.join(","))),
            FilterValue::Range { from, to } => {
                if let Some(f) = from {
                    out.push((format!("{name}_from"), f.clone()));
                }
                if let Some(t) = to {
                    out.push((format!("{name}_to"), t.clone()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    /// Zero-based page index.
    pub page: usize,
    pub page_size: usize,
    pub sort: Option<Sort>,
    pub filters: BTreeMap<String, FilterValue>,
}

impl QueryParams {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: 0,
            page_size,
            sort: None,
            filters: BTreeMap::new(),
        }
    }

    /// Set or clear one filter. Changing filters returns to the first page.
    pub fn set_filter(&mut self, name: impl Into<String>, value: FilterValue) {
        let name = name.into();
        if value.is_empty() {
            self.filters.remove(&name);
        } else {
            self.filters.insert(name, value);
        }
        self.page = 0;
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: FilterValue) -> Self {
        self.set_filter(name, value);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(Sort { field: field.into(), direction });
        self
    }

    pub fn offset(&self) -> usize {
        self.page * self.page_size
    }

    /// Flatten into query-string pairs for a REST client.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("page".to_string(), self.page.to_string()),
            ("pageSize".to_string(), self.page_size.to_string()),
        ];
        if let Some(sort) = &self.sort {
            let dir = match sort.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            out.push(("sort".to_string(), format!("{}:{}", sort.field, dir)));
        }
        for (name, value) in &self.filters {
            value.push_pairs(name, &mut out);
        }
        out
    }
}

impl Default for QueryParams {
    fn default() -> Self {
        Self::new(25)
    }
}

/// Cache key of one fetched page: the resource plus the query that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub resource: String,
    pub params: QueryParams,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>, params: QueryParams) -> Self {
        Self { resource: resource.into(), params }
    }

    pub fn matches(&self, resource: &str) -> bool {
        self.resource == resource
    }
}
