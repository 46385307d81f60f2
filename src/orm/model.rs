//! Per-entity metadata, query factory and CRUD entry points. One `Model` per (definition, schema).

use crate::case::underscore;
use crate::config::{validate_model, ModelConfig};
use crate::error::{AppError, ConfigError};
use crate::orm::hooks::{max_id, CREATED_AT, UPDATED_AT};
use crate::orm::{FieldDef, FieldType, IdStrategy, Record, RecordHook, SchemaCore, SerialIdHook, TimestampsHook};
use crate::sql::{Direction, QueryBuilder, Row};
use crate::store::{create_table_sql, ColumnDef, TableDef};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

/// Declarative model description registered on a schema.
#[derive(Clone)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub id_field: String,
    pub fields: Vec<FieldDef>,
    pub id_strategy: IdStrategy,
    pub timestamps: bool,
    hooks: Vec<Arc<dyn RecordHook>>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ModelDef {
            table: underscore(&name),
            name,
            id_field: "id".into(),
            fields: Vec::new(),
            id_strategy: IdStrategy::default(),
            timestamps: false,
            hooks: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.id_field = name.into();
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Adds `createdAt` / `updatedAt` fields maintained on save.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        for (name, column) in [(CREATED_AT, "created_at"), (UPDATED_AT, "updated_at")] {
            if !self.fields.iter().any(|f| f.name == name) {
                self.fields.push(FieldDef::new(name, FieldType::DateTime).column(column));
            }
        }
        self
    }

    pub fn hook(mut self, hook: impl RecordHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn from_config(config: &ModelConfig) -> Result<ModelDef, ConfigError> {
        validate_model(config)?;
        let mut def = ModelDef::new(&config.name).id_field(&config.id_field);
        if let Some(table) = &config.table {
            def = def.table(table);
        }
        for f in &config.fields {
            def = def.field(f.to_field());
        }
        if let Some(strategy) = config.id_strategy {
            def = def.id_strategy(strategy);
        }
        if config.timestamps {
            def = def.timestamps();
        }
        Ok(def)
    }

    pub(crate) fn check(&self) -> Result<(), ConfigError> {
        if !self.fields.is_empty() && !self.fields.iter().any(|f| f.name == self.id_field) {
            return Err(ConfigError::InvalidIdField {
                model: self.name.clone(),
                field: self.id_field.clone(),
            });
        }
        Ok(())
    }
}

pub(crate) struct ModelInner {
    def: ModelDef,
    hooks: Vec<Arc<dyn RecordHook>>,
    core: Arc<SchemaCore>,
    sequence: tokio::sync::Mutex<Option<i64>>,
}

#[derive(Clone)]
pub struct Model(Arc<ModelInner>);

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.0.def.name)
            .field("table", &self.0.def.table)
            .field("schema", &self.0.core.name)
            .finish()
    }
}

impl Model {
    pub(crate) fn from_def(def: ModelDef, core: Arc<SchemaCore>) -> Model {
        let mut hooks: Vec<Arc<dyn RecordHook>> = Vec::new();
        if def.fields.iter().any(|f| f.name == def.id_field && f.serial) {
            hooks.push(Arc::new(SerialIdHook {
                strategy: def.id_strategy,
            }));
        }
        if def.timestamps {
            hooks.push(Arc::new(TimestampsHook));
        }
        hooks.extend(def.hooks.iter().cloned());
        tracing::debug!(model = %def.name, table = %def.table, schema = %core.name, "model created");
        Model(Arc::new(ModelInner {
            def,
            hooks,
            core,
            sequence: tokio::sync::Mutex::new(None),
        }))
    }

    pub(crate) fn downgrade(&self) -> Weak<ModelInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<ModelInner>) -> Option<Model> {
        weak.upgrade().map(Model)
    }

    pub fn name(&self) -> &str {
        &self.0.def.name
    }

    pub fn table(&self) -> &str {
        &self.0.def.table
    }

    pub fn id_field(&self) -> &str {
        &self.0.def.id_field
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.0.def.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.0.def.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn hooks(&self) -> &[Arc<dyn RecordHook>] {
        &self.0.hooks
    }

    /// Column for an attribute name; unknown names pass through.
    pub fn column_name(&self, name: &str) -> String {
        match self.field(name) {
            Some(f) => f.column.clone(),
            None => name.to_string(),
        }
    }

    fn to_attrs(&self, row: Row) -> Row {
        row.into_iter()
            .map(|(k, v)| match self.fields().iter().find(|f| f.column == k) {
                Some(f) => (f.name.clone(), v),
                None => (k, v),
            })
            .collect()
    }

    /// Attribute map to column map. Attributes the model does not declare are dropped.
    fn to_columns(&self, data: Row) -> Row {
        if self.fields().is_empty() {
            return data;
        }
        let mut out = Row::new();
        for (k, v) in data {
            match self.field(&k) {
                Some(f) => {
                    out.insert(f.column.clone(), f.coerce(v));
                }
                None => tracing::debug!(model = %self.name(), attribute = %k, "ignoring undeclared attribute"),
            }
        }
        out
    }

    pub fn create_query_builder(&self) -> QueryBuilder {
        QueryBuilder::for_model(self.clone(), self.0.core.clone())
    }

    pub fn where_eq(&self, field: &str, value: impl Into<crate::sql::Arg>) -> QueryBuilder {
        self.create_query_builder().where_eq(field, value)
    }

    /// Fresh unsaved record with field defaults applied.
    pub fn new_record(&self, data: Row) -> Record {
        let mut attrs = Row::new();
        for f in self.fields() {
            if let Some(d) = &f.default {
                attrs.insert(f.name.clone(), d.clone());
            }
        }
        for (k, v) in data {
            let v = match self.field(&k) {
                Some(f) => f.coerce(v),
                None => v,
            };
            attrs.insert(k, v);
        }
        Record::with_model(self, attrs, true)
    }

    /// Turn a backend row into the identity-mapped record for its id.
    pub fn hydrate_record(&self, row: Row) -> Record {
        self.hydrate_attrs(self.to_attrs(row))
    }

    fn hydrate_attrs(&self, attrs: Row) -> Record {
        let id = attrs.get(self.id_field()).cloned().unwrap_or(Value::Null);
        self.0
            .core
            .cache
            .merge_or_insert(self.name(), &id, attrs, |data| Record::with_model(self, data, false))
    }

    pub fn hydrate_rows(&self, rows: Vec<Row>) -> Vec<Record> {
        rows.into_iter().map(|r| self.hydrate_record(r)).collect()
    }

    pub(crate) fn cache_put(&self, record: &Record) {
        self.0.core.cache.put(self.name(), &record.id(), record.clone());
    }

    pub fn cached(&self, id: &Value) -> Option<Record> {
        self.0.core.cache.get(self.name(), id)
    }

    pub fn un_cached(&self, id: &Value) -> Option<Record> {
        self.0.core.cache.remove(self.name(), id)
    }

    pub fn clear_cache(&self) {
        self.0.core.cache.clear_model(self.name());
    }

    pub async fn all(&self) -> Result<Vec<Record>, AppError> {
        Ok(self.create_query_builder().execute().await?.into_records())
    }

    /// Cached instance when present, without touching the backend.
    pub async fn find(&self, id: impl Into<Value>) -> Result<Option<Record>, AppError> {
        let id = id.into();
        if let Some(r) = self.cached(&id) {
            return Ok(Some(r));
        }
        let id_field = self.id_field().to_string();
        Ok(self
            .create_query_builder()
            .where_eq(&id_field, id)
            .first(&["*"])
            .execute()
            .await?
            .into_record())
    }

    pub async fn find_by(&self, field: &str, value: impl Into<crate::sql::Arg>) -> Result<Option<Record>, AppError> {
        Ok(self.where_eq(field, value).first(&["*"]).execute().await?.into_record())
    }

    /// First record of a query shaped by `f`.
    pub async fn find_one(&self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Result<Option<Record>, AppError> {
        Ok(f(self.create_query_builder())
            .first(&["*"])
            .execute()
            .await?
            .into_record())
    }

    pub async fn count(&self) -> Result<u64, AppError> {
        count_of(self.create_query_builder()).await
    }

    /// Build a record from `data` and save it, running hooks.
    pub async fn create(&self, data: Row) -> Result<Record, AppError> {
        self.new_record(data).save().await
    }

    pub async fn create_many(&self, rows: Vec<Row>) -> Result<Vec<Record>, AppError> {
        let mut out = Vec::with_capacity(rows.len());
        for data in rows {
            out.push(self.create(data).await?);
        }
        Ok(out)
    }

    /// Raw insert returning the stored attributes. A null or empty id is stripped.
    pub async fn insert(&self, mut data: Row) -> Result<Row, AppError> {
        let id_empty = match data.get(self.id_field()) {
            Some(Value::Null) | None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if id_empty {
            data.remove(self.id_field());
        }
        let row = self
            .create_query_builder()
            .plain()
            .insert(self.to_columns(data))
            .returning(&["*"])
            .execute()
            .await?
            .into_row()
            .ok_or_else(|| AppError::Backend(format!("insert into {} returned no row", self.table())))?;
        Ok(self.to_attrs(row))
    }

    pub(crate) async fn update_returning(&self, id: &Value, changes: Row) -> Result<Option<Row>, AppError> {
        let id_field = self.id_field().to_string();
        let changes = self.to_columns(changes);
        let qb = self.create_query_builder().plain().where_eq(&id_field, id.clone());
        let qb = if changes.is_empty() {
            qb.first(&["*"])
        } else {
            qb.update(changes).returning(&["*"])
        };
        Ok(qb.execute().await?.into_row().map(|r| self.to_attrs(r)))
    }

    /// Update by id; the identity-mapped instance, if any, sees the new values.
    pub async fn update(&self, id: impl Into<Value>, data: Row) -> Result<Option<Record>, AppError> {
        let id = id.into();
        let row = self.update_returning(&id, data).await?;
        Ok(row.map(|attrs| self.hydrate_attrs(attrs)))
    }

    /// Update when `data` carries a non-empty id that matches a row, create otherwise.
    pub async fn update_or_create(&self, data: Row) -> Result<Record, AppError> {
        let id = data.get(self.id_field()).cloned().unwrap_or(Value::Null);
        let has_id = match &id {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        };
        if has_id {
            let mut changes = data.clone();
            changes.remove(self.id_field());
            if let Some(r) = self.update(id, changes).await? {
                return Ok(r);
            }
        }
        self.create(data).await
    }

    /// Destroy the record with `id` through its hooks. Returns false when absent.
    pub async fn destroy(&self, id: impl Into<Value>) -> Result<bool, AppError> {
        match self.find(id).await? {
            Some(r) => {
                r.destroy().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) async fn delete_by_id(&self, id: &Value) -> Result<u64, AppError> {
        let id_field = self.id_field().to_string();
        Ok(self
            .create_query_builder()
            .where_eq(&id_field, id.clone())
            .remove()
            .execute()
            .await?
            .affected())
    }

    /// Visit every record in id order, `batch` rows per query.
    pub async fn iterate<F, Fut>(&self, batch: u64, f: F) -> Result<(), AppError>
    where
        F: FnMut(Record) -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        iterate_query(self, batch, |qb| qb, f).await
    }

    pub(crate) async fn next_sequence_id(&self) -> Result<i64, AppError> {
        let mut seq = self.0.sequence.lock().await;
        let next = match *seq {
            Some(n) => n + 1,
            None => max_id(self).await? + 1,
        };
        *seq = Some(next);
        Ok(next)
    }

    pub fn table_def(&self) -> TableDef {
        TableDef {
            schema: self.0.core.name.clone(),
            name: self.table().to_string(),
            primary_key: self.column_name(self.id_field()),
            columns: self
                .fields()
                .iter()
                .map(|f| ColumnDef {
                    name: f.column.clone(),
                    pg_type: f.field_type.pg_type(),
                    nullable: f.nullable && f.name != self.id_field(),
                    default: f.default.clone(),
                    auto_increment: f.serial,
                })
                .collect(),
        }
    }

    pub fn create_table_sql(&self) -> String {
        create_table_sql(&self.table_def())
    }

    /// Create the backing table when missing.
    pub async fn sync(&self) -> Result<(), AppError> {
        self.0.core.backend.sync_table(&self.table_def()).await
    }
}

pub(crate) async fn count_of(qb: QueryBuilder) -> Result<u64, AppError> {
    let n = qb.count("* as count").execute().await?.scalar();
    Ok(match n {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

pub(crate) async fn iterate_query<Q, F, Fut>(model: &Model, batch: u64, shape: Q, mut f: F) -> Result<(), AppError>
where
    Q: Fn(QueryBuilder) -> QueryBuilder,
    F: FnMut(Record) -> Fut,
    Fut: Future<Output = Result<(), AppError>>,
{
    let batch = batch.max(1);
    let id_field = model.id_field().to_string();
    let mut offset = 0;
    loop {
        let records = shape(model.create_query_builder())
            .order_by(&id_field, Direction::Asc)
            .limit(batch)
            .offset(offset)
            .execute()
            .await?
            .into_records();
        let n = records.len() as u64;
        for r in records {
            f(r).await?;
        }
        if n < batch {
            return Ok(());
        }
        offset += batch;
    }
}
