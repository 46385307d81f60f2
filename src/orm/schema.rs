//! A database schema: backend handle, identity cache, model registry and the current transaction.

use crate::config::{ModelConfig, Settings};
use crate::error::{AppError, ConfigError};
use crate::orm::{IdentityCache, Model, ModelDef};
use crate::sql::QueryBuilder;
use crate::store::{Backend, QueryOutput, TxId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// State shared by every model and builder of one schema.
pub struct SchemaCore {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) cache: IdentityCache,
    pub(crate) debug: bool,
    current_tx: Mutex<Option<TxId>>,
}

impl SchemaCore {
    pub fn current_transaction(&self) -> Option<TxId> {
        *self.current_tx.lock()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaOptions {
    /// Log rendered query text at debug level.
    pub debug: bool,
    pub cache_ttl: Option<Duration>,
}

#[derive(Default)]
struct Registry {
    defs: HashMap<String, ModelDef>,
    models: HashMap<String, Model>,
}

#[derive(Clone)]
pub struct Schema {
    core: Arc<SchemaCore>,
    registry: Arc<RwLock<Registry>>,
}

impl Schema {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self::with_options(name, backend, SchemaOptions::default())
    }

    pub fn with_options(name: impl Into<String>, backend: Arc<dyn Backend>, options: SchemaOptions) -> Self {
        Schema {
            core: Arc::new(SchemaCore {
                name: name.into(),
                backend,
                cache: IdentityCache::new(options.cache_ttl),
                debug: options.debug,
                current_tx: Mutex::new(None),
            }),
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub fn from_settings(settings: &Settings, backend: Arc<dyn Backend>) -> Self {
        Self::with_options(
            settings.schema.clone(),
            backend,
            SchemaOptions {
                debug: settings.db_debug,
                cache_ttl: settings.cache_ttl,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.core.backend
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.core.cache
    }

    /// Register a model definition. The `Model` itself is created on first use.
    pub fn define(&self, def: ModelDef) -> Result<(), ConfigError> {
        def.check()?;
        let mut reg = self.registry.write();
        if reg.defs.contains_key(&def.name) {
            return Err(ConfigError::Duplicate(def.name));
        }
        tracing::debug!(model = %def.name, schema = %self.core.name, "model defined");
        reg.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn define_all(&self, configs: &[ModelConfig]) -> Result<(), ConfigError> {
        for c in configs {
            self.define(ModelDef::from_config(c)?)?;
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Result<Model, AppError> {
        if let Some(m) = self.registry.read().models.get(name) {
            return Ok(m.clone());
        }
        let mut reg = self.registry.write();
        if let Some(m) = reg.models.get(name) {
            return Ok(m.clone());
        }
        let def = reg.defs.get(name).cloned().ok_or_else(|| ConfigError::MissingReference {
            kind: "model",
            id: name.to_string(),
        })?;
        let model = Model::from_def(def, self.core.clone());
        reg.models.insert(name.to_string(), model.clone());
        Ok(model)
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().defs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builder over a bare table; results are never hydrated.
    pub fn query(&self, table: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(self.core.clone(), table)
    }

    pub async fn raw(&self, sql: &str, bindings: &[Value]) -> Result<QueryOutput, AppError> {
        if self.core.debug {
            tracing::debug!(schema = %self.core.name, sql = %sql, params = ?bindings, "raw");
        }
        self.core
            .backend
            .raw(sql, bindings, self.core.current_transaction())
            .await
    }

    pub fn current_transaction(&self) -> Option<TxId> {
        self.core.current_transaction()
    }

    /// Run `work` inside a transaction that builders of this schema pick up
    /// automatically. Commits on `Ok`, rolls back on `Err`. Only one
    /// transaction may be open per schema.
    pub async fn transaction<F, Fut, T>(&self, work: F) -> Result<T, AppError>
    where
        F: FnOnce(TxId) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if self.current_transaction().is_some() {
            return Err(AppError::Backend(format!(
                "schema {} already has an open transaction",
                self.core.name
            )));
        }
        let tx = self.core.backend.begin().await?;
        let clash = {
            let mut current = self.core.current_tx.lock();
            match *current {
                Some(_) => true,
                None => {
                    *current = Some(tx);
                    false
                }
            }
        };
        if clash {
            if let Err(rb) = self.core.backend.rollback(tx).await {
                tracing::warn!(error = %rb, "rollback failed");
            }
            return Err(AppError::Backend(format!(
                "schema {} already has an open transaction",
                self.core.name
            )));
        }
        let mut guard = TxGuard {
            core: self.core.clone(),
            tx: Some(tx),
        };
        let out = work(tx).await;
        *self.core.current_tx.lock() = None;
        let res = match out {
            Ok(v) => self.core.backend.commit(tx).await.map(|_| v),
            Err(e) => {
                if let Err(rb) = self.core.backend.rollback(tx).await {
                    tracing::warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        };
        guard.tx = None;
        res
    }

    /// Create missing tables for every defined model.
    pub async fn sync(&self) -> Result<(), AppError> {
        for name in self.model_names() {
            self.model(&name)?.sync().await?;
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.core.cache.clear();
    }
}

/// Releases a transaction whose future was dropped before it finished:
/// clears the schema's current transaction and rolls it back in the background.
struct TxGuard {
    core: Arc<SchemaCore>,
    tx: Option<TxId>,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else { return };
        {
            let mut current = self.core.current_tx.lock();
            if *current == Some(tx) {
                *current = None;
            }
        }
        tracing::warn!(schema = %self.core.name, tx = %tx, "transaction abandoned; rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.core.backend.clone();
                handle.spawn(async move {
                    if let Err(rb) = backend.rollback(tx).await {
                        tracing::warn!(error = %rb, "rollback failed");
                    }
                });
            }
            Err(_) => tracing::warn!(tx = %tx, "no runtime to roll back abandoned transaction"),
        }
    }
}
