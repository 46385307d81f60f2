//! Has-many and belongs-to relations, built on demand from a record and a foreign model.

use crate::case::foreign_key;
use crate::error::AppError;
use crate::orm::model::{count_of, iterate_query};
use crate::orm::{Model, Record};
use crate::sql::{QueryBuilder, Row};
use serde_json::Value;
use std::future::Future;

/// Records of `foreign` whose foreign key equals the owner's id.
pub struct HasMany {
    owner: Record,
    foreign: Model,
    key: String,
}

impl HasMany {
    /// Foreign key by convention: underscored owner model name + `_id`.
    pub fn new(owner: &Record, foreign: &Model) -> Self {
        let key = foreign_key(owner.model_name());
        Self::with_key(owner, foreign, key)
    }

    pub fn with_key(owner: &Record, foreign: &Model, key: impl Into<String>) -> Self {
        HasMany {
            owner: owner.clone(),
            foreign: foreign.clone(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn scope(&self, qb: QueryBuilder) -> QueryBuilder {
        qb.where_eq(&self.key, self.owner.id())
    }

    pub fn query(&self) -> QueryBuilder {
        self.scope(self.foreign.create_query_builder())
    }

    pub async fn all(&self) -> Result<Vec<Record>, AppError> {
        Ok(self.query().execute().await?.into_records())
    }

    pub async fn find(&self, id: impl Into<Value>) -> Result<Option<Record>, AppError> {
        let id = id.into();
        let id_field = self.foreign.id_field().to_string();
        Ok(self
            .query()
            .where_eq(&id_field, id)
            .first(&["*"])
            .execute()
            .await?
            .into_record())
    }

    pub async fn find_one(&self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Result<Option<Record>, AppError> {
        Ok(f(self.query()).first(&["*"]).execute().await?.into_record())
    }

    pub async fn count(&self) -> Result<u64, AppError> {
        count_of(self.query()).await
    }

    fn owned(&self, mut data: Row) -> Row {
        data.insert(self.key.clone(), self.owner.id());
        data
    }

    pub async fn create(&self, data: Row) -> Result<Record, AppError> {
        self.foreign.create(self.owned(data)).await
    }

    pub async fn update_or_create(&self, data: Row) -> Result<Record, AppError> {
        self.foreign.update_or_create(self.owned(data)).await
    }

    pub async fn iterate<F, Fut>(&self, batch: u64, f: F) -> Result<(), AppError>
    where
        F: FnMut(Record) -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        iterate_query(&self.foreign, batch, |qb| self.scope(qb), f).await
    }

    /// Destroy each related record in turn, stopping at the first error.
    pub async fn destroy_all(&self) -> Result<u64, AppError> {
        let mut n = 0;
        for r in self.all().await? {
            r.destroy().await?;
            n += 1;
        }
        Ok(n)
    }
}

/// The `foreign` record referenced by the owner's foreign key.
pub struct BelongsTo {
    owner: Record,
    foreign: Model,
    key: String,
}

impl BelongsTo {
    /// Foreign key by convention: underscored foreign model name + `_id` on the owner.
    pub fn new(owner: &Record, foreign: &Model) -> Self {
        let key = foreign_key(foreign.name());
        Self::with_key(owner, foreign, key)
    }

    pub fn with_key(owner: &Record, foreign: &Model, key: impl Into<String>) -> Self {
        BelongsTo {
            owner: owner.clone(),
            foreign: foreign.clone(),
            key: key.into(),
        }
    }

    pub async fn get(&self) -> Result<Option<Record>, AppError> {
        match self.owner.get(&self.key) {
            Value::Null => Ok(None),
            id => self.foreign.find(id).await,
        }
    }
}

impl Record {
    pub fn has_many(&self, foreign: &Model) -> HasMany {
        HasMany::new(self, foreign)
    }

    pub fn belongs_to(&self, foreign: &Model) -> BelongsTo {
        BelongsTo::new(self, foreign)
    }
}
