//! Persistence backends. A backend executes rendered query intent, raw SQL and transactions.

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::{create_table_sql, PgBackend};

use crate::error::AppError;
use crate::sql::{Query, Row};
use async_trait::async_trait;
use serde_json::Value;

/// Handle of an open transaction.
pub type TxId = uuid::Uuid;

#[derive(Clone, Debug)]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Affected(u64),
}

impl QueryOutput {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Affected(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub pg_type: &'static str,
    pub nullable: bool,
    pub default: Option<Value>,
    /// Database assigns the value when the insert omits it.
    pub auto_increment: bool,
}

/// Table shape derived from a model, used for DDL.
#[derive(Clone, Debug)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, query: &Query, tx: Option<TxId>) -> Result<QueryOutput, AppError>;

    /// Raw SQL with `$n` placeholders.
    async fn raw(&self, sql: &str, bindings: &[Value], tx: Option<TxId>) -> Result<QueryOutput, AppError>;

    /// Create the table if it does not exist.
    async fn sync_table(&self, table: &TableDef) -> Result<(), AppError>;

    async fn begin(&self) -> Result<TxId, AppError>;
    async fn commit(&self, tx: TxId) -> Result<(), AppError>;
    async fn rollback(&self, tx: TxId) -> Result<(), AppError>;
}
