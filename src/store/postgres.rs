//! PostgreSQL backend over a sqlx pool. Open transactions are parked by id until commit or rollback.

use crate::error::AppError;
use crate::sql::{quoted, to_sql, Operation, PgBindValue, Query, Row};
use crate::store::{Backend, QueryOutput, TableDef, TxId};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use tokio::sync::Mutex;

pub struct PgBackend {
    pool: PgPool,
    txs: Mutex<HashMap<TxId, Transaction<'static, Postgres>>>,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        PgBackend {
            pool,
            txs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        tracing::info!("connected to database");
        Ok(PgBackend::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run(&self, sql: &str, params: &[Value], tx: Option<TxId>, rows: bool) -> Result<QueryOutput, AppError> {
        tracing::trace!(sql = %sql, params = ?params, tx = ?tx, "pg");
        let mut query = sqlx::query(sql);
        for p in params {
            query = query.bind(PgBindValue::from_json(p));
        }
        match tx {
            Some(id) => {
                let mut txs = self.txs.lock().await;
                let t = txs
                    .get_mut(&id)
                    .ok_or_else(|| AppError::Backend(format!("no open transaction {}", id)))?;
                if rows {
                    let out = query.fetch_all(&mut **t).await?;
                    Ok(QueryOutput::Rows(out.iter().map(row_to_json).collect()))
                } else {
                    let res = query.execute(&mut **t).await?;
                    Ok(QueryOutput::Affected(res.rows_affected()))
                }
            }
            None => {
                if rows {
                    let out = query.fetch_all(&self.pool).await?;
                    Ok(QueryOutput::Rows(out.iter().map(row_to_json).collect()))
                } else {
                    let res = query.execute(&self.pool).await?;
                    Ok(QueryOutput::Affected(res.rows_affected()))
                }
            }
        }
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn execute(&self, query: &Query, tx: Option<TxId>) -> Result<QueryOutput, AppError> {
        let buf = to_sql(query);
        let rows = query.op == Operation::Select || !query.returning.is_empty();
        self.run(&buf.sql, &buf.params, tx, rows).await
    }

    async fn raw(&self, sql: &str, bindings: &[Value], tx: Option<TxId>) -> Result<QueryOutput, AppError> {
        self.run(sql, bindings, tx, true).await
    }

    async fn sync_table(&self, table: &TableDef) -> Result<(), AppError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(&table.schema)))
            .execute(&self.pool)
            .await?;
        let ddl = create_table_sql(table);
        tracing::debug!(sql = %ddl, "sync table");
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> Result<TxId, AppError> {
        let t = self.pool.begin().await?;
        let id = TxId::new_v4();
        self.txs.lock().await.insert(id, t);
        Ok(id)
    }

    async fn commit(&self, tx: TxId) -> Result<(), AppError> {
        let t = self.txs.lock().await.remove(&tx);
        match t {
            Some(t) => Ok(t.commit().await?),
            None => Err(AppError::Backend(format!("no open transaction {}", tx))),
        }
    }

    async fn rollback(&self, tx: TxId) -> Result<(), AppError> {
        let t = self.txs.lock().await.remove(&tx);
        match t {
            Some(t) => Ok(t.rollback().await?),
            None => Err(AppError::Backend(format!("no open transaction {}", tx))),
        }
    }
}

fn literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".into(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) | Value::Object(_) => format!("'{}'::jsonb", v.to_string().replace('\'', "''")),
    }
}

/// `CREATE TABLE IF NOT EXISTS` statement for a model table.
pub fn create_table_sql(table: &TableDef) -> String {
    let mut defs: Vec<String> = Vec::with_capacity(table.columns.len() + 1);
    for c in &table.columns {
        let typ = match (c.auto_increment, c.pg_type) {
            (true, "bigint") => "bigserial",
            (true, _) => "serial",
            (false, t) => t,
        };
        let mut def = format!("{} {}", quoted(&c.name), typ);
        if !c.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(d) = &c.default {
            def.push_str(" DEFAULT ");
            def.push_str(&literal(d));
        }
        defs.push(def);
    }
    defs.push(format!("PRIMARY KEY ({})", quoted(&table.primary_key)));
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quoted(&table.schema),
        quoted(&table.name),
        defs.join(", ")
    )
}

fn row_to_json(row: &PgRow) -> Row {
    use sqlx::{Column, Row as _};
    let mut map = Row::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
