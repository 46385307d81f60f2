//! Railcar: MVC web framework with pattern routing, filtered controllers,
//! content negotiation and an identity-mapped ORM over a pluggable backend.

pub mod app;
pub mod auth;
pub mod case;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod orm;
pub mod render;
pub mod router;
pub mod session;
pub mod sql;
pub mod state;
pub mod store;

pub use app::{router_for, App};
pub use auth::{AccessControl, Authenticator, LocalStrategy, RequireLogin, Strategy};
pub use config::Settings;
pub use controller::{action_fn, filter_fn, Action, ControllerDef, Context, Filter, Flow, RespondOptions};
pub use error::{AppError, ConfigError};
pub use format::{Format, FormatKind, FormatRegistry};
pub use orm::{FieldDef, FieldType, Model, ModelDef, Record, Schema};
pub use render::{FnRenderer, Renderer, RendererRegistry};
pub use router::{ResourceStyle, Router};
pub use session::{MemorySessionStore, Session, SessionStore};
pub use sql::{QueryBuilder, QueryResult};
pub use state::AppState;
pub use store::{Backend, MemoryBackend, PgBackend};
