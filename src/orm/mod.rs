//! Thin ORM: models, identity-mapped records, hooks and relations.

mod cache;
mod field;
mod hooks;
mod model;
mod record;
mod relation;
mod schema;
mod validation;

pub use cache::{id_key, IdentityCache};
pub use field::*;
pub use hooks::*;
pub use model::{Model, ModelDef};
pub use record::Record;
pub use relation::{BelongsTo, HasMany};
pub use schema::{Schema, SchemaCore, SchemaOptions};
pub use validation::validate_record;
