//! A persisted entity instance. Records are shared handles: clones point at the same attributes.

use crate::error::AppError;
use crate::orm::model::{Model, ModelInner};
use crate::orm::validation::validate_record;
use crate::orm::HookOutcome;
use crate::sql::Row;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct RecordInner {
    model: Weak<ModelInner>,
    model_name: String,
    id_field: String,
    data: RwLock<Row>,
    new_record: AtomicBool,
}

#[derive(Clone)]
pub struct Record(Arc<RecordInner>);

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.0.model_name)
            .field("new", &self.is_new_record())
            .field("data", &*self.0.data.read())
            .finish()
    }
}

impl serde::Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&*self.0.data.read(), serializer)
    }
}

impl Record {
    pub(crate) fn with_model(model: &Model, data: Row, new_record: bool) -> Record {
        Record(Arc::new(RecordInner {
            model: model.downgrade(),
            model_name: model.name().to_string(),
            id_field: model.id_field().to_string(),
            data: RwLock::new(data),
            new_record: AtomicBool::new(new_record),
        }))
    }

    /// A record not attached to any model. Persistence calls fail on it.
    pub fn detached(model_name: &str, id_field: &str, data: Row) -> Record {
        Record(Arc::new(RecordInner {
            model: Weak::new(),
            model_name: model_name.to_string(),
            id_field: id_field.to_string(),
            data: RwLock::new(data),
            new_record: AtomicBool::new(true),
        }))
    }

    pub fn model(&self) -> Result<Model, AppError> {
        Model::upgrade(&self.0.model)
            .ok_or_else(|| AppError::Internal(format!("model {} is no longer available", self.0.model_name)))
    }

    pub fn model_name(&self) -> &str {
        &self.0.model_name
    }

    /// Same underlying instance.
    pub fn ptr_eq(a: &Record, b: &Record) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn get(&self, name: &str) -> Value {
        self.0.data.read().get(name).cloned().unwrap_or(Value::Null)
    }

    /// Set an attribute, coerced to the field's type when the model declares it.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let value = match Model::upgrade(&self.0.model).as_ref().and_then(|m| m.field(name)) {
            Some(f) => f.coerce(value),
            None => value,
        };
        self.0.data.write().insert(name.to_string(), value);
    }

    pub fn id(&self) -> Value {
        self.get(&self.0.id_field)
    }

    pub fn id_field(&self) -> &str {
        &self.0.id_field
    }

    /// True until the first successful save.
    pub fn is_new_record(&self) -> bool {
        self.0.new_record.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_persisted(&self) {
        self.0.new_record.store(false, Ordering::SeqCst);
    }

    /// Snapshot of the attributes.
    pub fn data(&self) -> Row {
        self.0.data.read().clone()
    }

    /// Merge attributes into this instance.
    pub fn from_data_object(&self, data: Row) {
        let mut current = self.0.data.write();
        for (k, v) in data {
            current.insert(k, v);
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.data())
    }

    /// Validate, run before-save hooks, then insert or update by primary key.
    /// A hook returning `Abort` skips persistence and returns the record unchanged.
    pub async fn save(&self) -> Result<Record, AppError> {
        let model = self.model()?;
        validate_record(model.fields(), &self.data(), self.is_new_record())?;
        for hook in model.hooks() {
            if let HookOutcome::Abort = hook.before_save(self, &model).await? {
                tracing::debug!(model = %model.name(), "save aborted by hook");
                return Ok(self.clone());
            }
        }
        let result = if self.is_new_record() {
            match model.insert(self.data()).await {
                Ok(row) => {
                    self.from_data_object(row);
                    self.mark_persisted();
                    model.cache_put(self);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            let mut changes = self.data();
            changes.remove(self.id_field());
            match model.update_returning(&self.id(), changes).await {
                Ok(Some(row)) => {
                    self.from_data_object(row);
                    Ok(())
                }
                Ok(None) => Err(AppError::NotFound(format!("{} {}", model.name(), self.id()))),
                Err(e) => Err(e),
            }
        };
        for hook in model.hooks() {
            hook.after_save(self, result.as_ref().err()).await;
        }
        result.map(|_| self.clone())
    }

    /// Run destroy hooks around a delete by primary key. The cache entry stays
    /// in place; call `un_cached` to drop it.
    pub async fn destroy(&self) -> Result<(), AppError> {
        let model = self.model()?;
        for hook in model.hooks() {
            if let HookOutcome::Abort = hook.before_destroy(self).await? {
                tracing::debug!(model = %model.name(), "destroy aborted by hook");
                return Ok(());
            }
        }
        let result = model.delete_by_id(&self.id()).await.map(|_| ());
        for hook in model.hooks() {
            hook.after_destroy(self, result.as_ref().err()).await;
        }
        result
    }

    /// Drop this record from the identity cache.
    pub fn un_cached(&self) {
        if let Some(model) = Model::upgrade(&self.0.model) {
            model.un_cached(&self.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_attributes() {
        let a = Record::detached("User", "id", Row::new());
        let b = a.clone();
        a.set("name", "ann");
        assert_eq!(b.get("name"), json!("ann"));
        assert!(Record::ptr_eq(&a, &b));
    }

    #[test]
    fn from_data_object_merges() {
        let r = Record::detached("User", "id", json!({"id": 1, "name": "a"}).as_object().cloned().unwrap());
        r.from_data_object(json!({"name": "b", "age": 3}).as_object().cloned().unwrap());
        assert_eq!(r.to_json(), json!({"id": 1, "name": "b", "age": 3}));
    }

    #[tokio::test]
    async fn detached_records_cannot_save() {
        let r = Record::detached("User", "id", Row::new());
        assert!(matches!(r.save().await, Err(AppError::Internal(_))));
    }
}
