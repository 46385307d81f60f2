//! Identity map: at most one live `Record` per (model, id).

use crate::orm::Record;
use crate::sql::Row;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    record: Record,
    stored: Instant,
}

/// Cache service owned by a schema and shared by its models.
#[derive(Default)]
pub struct IdentityCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    ttl: Option<Duration>,
}

/// Cache key for an id value; `7` and `"7"` share a slot.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl IdentityCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        IdentityCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, model: &str, id: &Value) -> Option<Record> {
        let key = (model.to_string(), id_key(id)?);
        let mut entries = self.entries.lock();
        let expired = match entries.get(&key) {
            Some(e) => self.ttl.map(|ttl| e.stored.elapsed() > ttl).unwrap_or(false),
            None => return None,
        };
        if expired {
            entries.remove(&key);
            return None;
        }
        entries.get(&key).map(|e| e.record.clone())
    }

    pub fn put(&self, model: &str, id: &Value, record: Record) {
        if let Some(id) = id_key(id) {
            self.entries.lock().insert(
                (model.to_string(), id),
                Entry {
                    record,
                    stored: Instant::now(),
                },
            );
        }
    }

    /// Merge `data` into the cached instance for `id`, or build and cache a new one.
    /// Runs under one lock so concurrent hydrations of the same id share an instance.
    pub fn merge_or_insert(
        &self,
        model: &str,
        id: &Value,
        data: Row,
        make: impl FnOnce(Row) -> Record,
    ) -> Record {
        let Some(key) = id_key(id) else {
            return make(data);
        };
        let key = (model.to_string(), key);
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get(&key) {
            if self.ttl.map(|ttl| e.stored.elapsed() <= ttl).unwrap_or(true) {
                e.record.from_data_object(data);
                return e.record.clone();
            }
        }
        let record = make(data);
        entries.insert(
            key,
            Entry {
                record: record.clone(),
                stored: Instant::now(),
            },
        );
        record
    }

    pub fn remove(&self, model: &str, id: &Value) -> Option<Record> {
        let key = (model.to_string(), id_key(id)?);
        self.entries.lock().remove(&key).map(|e| e.record)
    }

    pub fn clear_model(&self, model: &str) {
        self.entries.lock().retain(|(m, _), _| m != model);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
