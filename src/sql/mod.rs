//! Query intent, PostgreSQL rendering and the fluent builder. Identifiers are quoted, values always travel as parameters.

mod builder;
pub mod params;
mod query;
mod render;

pub use builder::*;
pub use params::*;
pub use query::*;
pub use render::{quoted, split_alias, to_sql, QueryBuf};
