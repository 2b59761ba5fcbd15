//! Adapters between arbitrary server response shapes and "rows + total".

use serde_json::Value;

pub trait ResponseAdapter: Send + Sync {
    /// Rows of the page, in display order.
    fn response_rows(&self, response: &Value) -> Vec<Value>;

    /// Total number of rows across all pages.
    fn response_row_count(&self, response: &Value) -> usize;

    /// Rebuild a response of the same shape as `previous` around new rows.
    fn optimistic_response(&self, previous: &Value, rows: Vec<Value>, count: usize) -> Value;
}

/// Handles bare arrays and `{ <rows_field>: [...], <count_field>: n }` objects.
#[derive(Debug, Clone)]
pub struct DefaultAdapter {
    pub rows_field: String,
    pub count_field: String,
}

impl Default for DefaultAdapter {
    fn default() -> Self {
        Self {
            rows_field: "data".into(),
            count_field: "total".into(),
        }
    }
}

impl DefaultAdapter {
    pub fn new(rows_field: impl Into<String>, count_field: impl Into<String>) -> Self {
        Self { rows_field: rows_field.into(), count_field: count_field.into() }
    }
}

impl ResponseAdapter for DefaultAdapter {
    fn response_rows(&self, response: &Value) -> Vec<Value> {
        match response {
            Value::Array(rows) => rows.clone(),
            Value::Object(map) => match map.get(&self.rows_field) {
                Some(Value::Array(rows)) => rows.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn response_row_count(&self, response: &Value) -> usize {
        match response {
            Value::Array(rows) => rows.len(),
            Value::Object(map) => map
                .get(&self.count_field)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or_else(|| self.response_rows(response).len()),
            _ => 0,
        }
    }

    fn optimistic_response(&self, previous: &Value, rows: Vec<Value>, count: usize) -> Value {
        match previous {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert(self.rows_field.clone(), Value::Array(rows));
                map.insert(self.count_field.clone(), Value::from(count));
                Value::Object(map)
            }
            _ => Value::Array(rows),
        }
    }
}

/// Rewrite the rows of `response`, adjusting the total by the change in row count.
pub fn patch_rows(
    adapter: &dyn ResponseAdapter,
    response: &Value,
    f: impl FnOnce(Vec<Value>) -> Vec<Value>,
) -> Value {
    let rows = adapter.response_rows(response);
    let before = rows.len();
    let total = adapter.response_row_count(response);
    let rows = f(rows);
    let total = (total + rows.len()).saturating_sub(before);
    adapter.optimistic_response(response, rows, total)
}
