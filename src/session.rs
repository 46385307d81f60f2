//! Cookie-keyed sessions over a pluggable async store.

use crate::error::AppError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a store persists for one session id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub data: Map<String, Value>,
    pub expires: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, AppError>;
    async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), AppError>;
    async fn destroy(&self, id: &str) -> Result<(), AppError>;
}

/// Process-local store. Expired records are dropped on load and swept on save.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, AppError> {
        let mut entries = self.entries.lock();
        let expired = matches!(entries.get(id), Some(r) if r.expires.is_some_and(|e| e <= Utc::now()));
        if expired {
            entries.remove(id);
            return Ok(None);
        }
        Ok(entries.get(id).cloned())
    }

    async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), AppError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, r| r.expires.map_or(true, |e| e > now));
        entries.insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), AppError> {
        self.entries.lock().remove(id);
        Ok(())
    }
}

/// The session of one request.
pub struct Session {
    id: String,
    data: Map<String, Value>,
    max_age: Duration,
    accessed: DateTime<Utc>,
    is_new: bool,
    destroyed: bool,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("is_new", &self.is_new)
            .finish()
    }
}

/// Session id from the `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

impl Session {
    /// Load the session named by `id`, or start a fresh one when the id is
    /// missing, unknown or expired.
    pub async fn open(store: Arc<dyn SessionStore>, id: Option<String>, max_age: Duration) -> Result<Session, AppError> {
        let found = match &id {
            Some(id) => store.load(id).await?,
            None => None,
        };
        let (id, data, is_new) = match (id, found) {
            (Some(id), Some(rec)) => (id, rec.data, false),
            _ => (uuid::Uuid::new_v4().simple().to_string(), Map::new(), true),
        };
        Ok(Session {
            id,
            data,
            max_age,
            accessed: Utc::now(),
            is_new,
            destroyed: false,
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn unset(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.accessed + chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Record an access; pushes `expires` forward.
    pub fn touch(&mut self) {
        self.accessed = Utc::now();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether the response should store this session and send its cookie.
    /// A fresh session nobody wrote to is dropped.
    pub fn is_persistent(&self) -> bool {
        self.destroyed || !self.is_new || !self.data.is_empty()
    }

    pub async fn save(&mut self) -> Result<(), AppError> {
        if self.destroyed {
            return Ok(());
        }
        let record = SessionRecord {
            data: self.data.clone(),
            expires: Some(self.expires()),
        };
        self.store.save(&self.id, &record).await?;
        self.is_new = false;
        Ok(())
    }

    /// Remove from the store and clear the data. Later saves are no-ops.
    pub async fn destroy(&mut self) -> Result<(), AppError> {
        self.store.destroy(&self.id).await?;
        self.data.clear();
        self.destroyed = true;
        Ok(())
    }

    /// `Set-Cookie` value carrying the id, or expiring it after `destroy`.
    pub fn cookie(&self, name: &str) -> String {
        if self.destroyed {
            return format!("{}=; Path=/; HttpOnly; Max-Age=0", name);
        }
        format!("{}={}; Path=/; HttpOnly; Max-Age={}", name, self.id, self.max_age.as_secs())
    }
}
