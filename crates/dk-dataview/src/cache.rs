//! Paged-collection cache contract and an in-memory implementation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use crate::query::QueryKey;

/// Key/value store of fetched pages.
///
/// Values are raw server responses; a `ResponseAdapter` reads rows out of
/// them and rebuilds them after a patch.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &QueryKey) -> Option<Value>;

    /// Store a fresh server response, clearing any stale mark.
    fn insert(&self, key: QueryKey, value: Value);

    /// Replace the entry with `update(previous)`. `None` leaves it untouched.
    fn set(&self, key: &QueryKey, update: &dyn Fn(Option<&Value>) -> Option<Value>);

    /// Apply `update` to every entry of `resource`; returns how many changed.
    fn set_matching(&self, resource: &str, update: &dyn Fn(&Value) -> Value) -> usize;

    /// Mark every entry of `resource` stale so the next read refetches.
    fn invalidate(&self, resource: &str) -> usize;

    fn is_stale(&self, key: &QueryKey) -> bool;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    stale: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<QueryKey, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn updated_at(&self, key: &QueryKey) -> Option<DateTime<Utc>> {
        self.entries.read().get(key).map(|e| e.updated_at)
    }
}

impl QueryCache for MemoryCache {
    fn get(&self, key: &QueryKey) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    fn insert(&self, key: QueryKey, value: Value) {
        self.entries.write().insert(
            key,
            Entry { value, stale: false, updated_at: Utc::now() },
        );
    }

    fn set(&self, key: &QueryKey, update: &dyn Fn(Option<&Value>) -> Option<Value>) {
        let mut entries = self.entries.write();
        let Some(next) = update(entries.get(key).map(|e| &e.value)) else {
            return;
        };
        let stale = entries.get(key).is_some_and(|e| e.stale);
        entries.insert(
            key.clone(),
            Entry { value: next, stale, updated_at: Utc::now() },
        );
    }

    fn set_matching(&self, resource: &str, update: &dyn Fn(&Value) -> Value) -> usize {
        let mut changed = 0;
        for (key, entry) in self.entries.write().iter_mut() {
            if !key.matches(resource) {
                continue;
            }
            let next = update(&entry.value);
            if next != entry.value {
                entry.value = next;
                entry.updated_at = Utc::now();
                changed += 1;
            }
        }
        changed
    }

    fn invalidate(&self, resource: &str) -> usize {
        let mut count = 0;
        for (key, entry) in self.entries.write().iter_mut() {
            if key.matches(resource) {
                entry.stale = true;
                count += 1;
            }
        }
        tracing::debug!(resource, count, "cache entries invalidated");
        count
    }

    fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries.read().get(key).map_or(true, |e| e.stale)
    }
}
