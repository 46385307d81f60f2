//! Record lifecycle hooks and the built-in serial id and timestamp hooks.

use crate::error::AppError;
use crate::orm::{id_key, Model, Record};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a before-hook. `Abort` is a silent short-circuit, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Abort,
}

/// Hooks run in registration order. After-hooks always fire once the
/// operation was attempted, with the error if it failed.
#[async_trait]
pub trait RecordHook: Send + Sync {
    async fn before_save(&self, _record: &Record, _model: &Model) -> Result<HookOutcome, AppError> {
        Ok(HookOutcome::Continue)
    }

    async fn after_save(&self, _record: &Record, _error: Option<&AppError>) {}

    async fn before_destroy(&self, _record: &Record) -> Result<HookOutcome, AppError> {
        Ok(HookOutcome::Continue)
    }

    async fn after_destroy(&self, _record: &Record, _error: Option<&AppError>) {}
}

/// How a serial id is chosen for a new record whose id is null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// `max(id) + 1`, read then written in separate queries. Concurrent saves
    /// can pick the same id.
    #[default]
    MaxPlusOne,
    /// In-process counter seeded once from `max(id)`; unique within one process.
    Sequence,
}

pub struct SerialIdHook {
    pub strategy: IdStrategy,
}

pub(crate) async fn max_id(model: &Model) -> Result<i64, AppError> {
    let max = model
        .create_query_builder()
        .max(&format!("{} as max", model.id_field()))
        .execute()
        .await?
        .scalar();
    Ok(match max {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

#[async_trait]
impl RecordHook for SerialIdHook {
    async fn before_save(&self, record: &Record, model: &Model) -> Result<HookOutcome, AppError> {
        if id_key(&record.id()).is_some() {
            return Ok(HookOutcome::Continue);
        }
        let next = match self.strategy {
            IdStrategy::MaxPlusOne => max_id(model).await? + 1,
            IdStrategy::Sequence => model.next_sequence_id().await?,
        };
        record.set(model.id_field(), next);
        Ok(HookOutcome::Continue)
    }
}

/// Sets `createdAt` on first save and `updatedAt` on every save, when the model has those fields.
pub struct TimestampsHook;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

#[async_trait]
impl RecordHook for TimestampsHook {
    async fn before_save(&self, record: &Record, model: &Model) -> Result<HookOutcome, AppError> {
        let now = Utc::now().to_rfc3339();
        if record.is_new_record() && model.field(CREATED_AT).is_some() {
            record.set(CREATED_AT, now.clone());
        }
        if model.field(UPDATED_AT).is_some() {
            record.set(UPDATED_AT, now);
        }
        Ok(HookOutcome::Continue)
    }
}
