//! Pending-state overlay on cached rows.
//!
//! A row touched by an uncommitted operation carries a tag under
//! [`PENDING_KEY`]; rows inserted by a create intent also carry a temporary id
//! under [`TEMP_ID_KEY`]. Both keys are metadata, never part of the entity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const PENDING_KEY: &str = "__pending";
pub const TEMP_ID_KEY: &str = "__tempId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingState {
    Added,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTag {
    pub state: PendingState,
    pub operation_id: String,
    /// Last known-good entity, restored when the change is undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
}

pub fn pending_tag(row: &Value) -> Option<PendingTag> {
    row.get(PENDING_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

pub fn temp_id(row: &Value) -> Option<&str> {
    row.get(TEMP_ID_KEY).and_then(Value::as_str)
}

/// Row id as a string, for string or numeric id fields.
pub fn row_id(row: &Value, id_field: &str) -> Option<String> {
    match row.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The entity without overlay keys.
pub fn entity(row: &Value) -> Value {
    let mut clean = row.clone();
    strip(&mut clean);
    clean
}

pub fn strip(row: &mut Value) {
    if let Value::Object(map) = row {
        map.remove(PENDING_KEY);
        map.remove(TEMP_ID_KEY);
    }
}

/// Tag `row`, replacing any earlier tag. The earliest known-good snapshot is
/// kept so that undo returns to the state before the first pending change.
pub fn tag_row(row: &mut Value, state: PendingState, operation_id: &str) {
    let original = match pending_tag(row) {
        Some(previous) => previous.original,
        None if state == PendingState::Added => None,
        None => Some(entity(row)),
    };
    let tag = PendingTag {
        state,
        operation_id: operation_id.to_string(),
        original,
    };
    if let (Value::Object(map), Ok(encoded)) = (row, serde_json::to_value(&tag)) {
        map.insert(PENDING_KEY.to_string(), encoded);
    }
}

pub fn mark_temporary(row: &mut Value, temp: &str) {
    if let Value::Object(map) = row {
        map.insert(TEMP_ID_KEY.to_string(), Value::String(temp.to_string()));
    }
}

/// Shallow-merge `changes` into `row`; non-object changes replace the entity
/// while keeping overlay keys.
pub fn merge(row: &mut Value, changes: &Value) {
    match (row, changes) {
        (Value::Object(map), Value::Object(changes)) => {
            for (k, v) in changes {
                map.insert(k.clone(), v.clone());
            }
        }
        (row, changes) => {
            let overlay: Map<String, Value> = row
                .as_object()
                .map(|m| {
                    m.iter()
                        .filter(|(k, _)| *k == PENDING_KEY || *k == TEMP_ID_KEY)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default();
            *row = changes.clone();
            if let Value::Object(map) = row {
                map.extend(overlay);
            }
        }
    }
}

/// Undo the visual effect of a pending change.
///
/// Added or temporary rows disappear (`None`); edited and deleted rows go back
/// to their known-good snapshot, or just lose the tag when none was taken.
pub fn revert_row(row: Value) -> Option<Value> {
    if temp_id(&row).is_some() {
        return None;
    }
    match pending_tag(&row) {
        None => Some(row),
        Some(tag) if tag.state == PendingState::Added => None,
        Some(tag) => Some(tag.original.unwrap_or_else(|| entity(&row))),
    }
}

/// Revert rows whose tag came from one of `operation_ids`.
pub fn revert_operations(rows: Vec<Value>, operation_ids: &HashSet<String>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| match pending_tag(&row) {
            Some(tag) if operation_ids.contains(&tag.operation_id) => revert_row(row),
            _ => Some(row),
        })
        .collect()
}

/// Drop the overlay of rows whose tag came from one of `operation_ids`.
pub fn strip_operations(rows: Vec<Value>, operation_ids: &HashSet<String>) -> Vec<Value> {
    rows.into_iter()
        .map(|mut row| {
            if pending_tag(&row).is_some_and(|t| operation_ids.contains(&t.operation_id)) {
                strip(&mut row);
            }
            row
        })
        .collect()
}

/// Swap the row with temporary id `temp` for the server's `created` entity,
/// keeping the overlay so later cancel/complete handling still sees it.
pub fn replace_temporary(rows: Vec<Value>, temp: &str, created: &Value) -> Vec<Value> {
    rows.into_iter()
        .map(|row| {
            if temp_id(&row) != Some(temp) {
                return row;
            }
            let mut replacement = created.clone();
            if let (Value::Object(map), Some(tag)) = (&mut replacement, row.get(PENDING_KEY)) {
                map.insert(PENDING_KEY.to_string(), tag.clone());
            }
            mark_temporary(&mut replacement, temp);
            replacement
        })
        .collect()
}
