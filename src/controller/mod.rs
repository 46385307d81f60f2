//! Controllers: actions, before/after filter chains and the per-request `Context`.
//!
//! Before-filters run one at a time in registration order. The chain stops when
//! a filter returns `Flow::Abort` or when the context has already responded;
//! the action runs only if nothing responded. After-filters run from
//! `Context::output`, once the response is final.

mod context;
mod cors;
mod def;
mod request;

pub use context::{Context, RespondOptions};
pub use cors::CorsFilter;
pub use def::{action_fn, filter_fn, Action, ActionFn, ControllerDef, Filter, FilterFn, Selector};
pub use request::Request;

use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

/// Response a filter aborts with; negotiated like any other.
#[derive(Clone, Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub content: Value,
}

/// Result of one filter.
#[derive(Clone, Debug)]
pub enum Flow {
    Continue,
    /// Stop the chain. In the before phase the reply is sent and the action skipped.
    Abort(Reply),
}

impl Flow {
    pub fn abort(status: StatusCode, content: impl Into<Value>) -> Flow {
        Flow::Abort(Reply {
            status,
            content: content.into(),
        })
    }
}

/// Run the filters of `phase` for the context's action. Returns the reply of
/// an aborting filter; sending it is up to the caller.
pub async fn exec_filters(ctx: &mut Context, phase: Phase) -> Result<Option<Reply>, AppError> {
    let def = ctx.controller_def();
    let action = ctx.action().to_string();
    for filter in def.filters(phase, &action) {
        if phase == Phase::Before && ctx.is_completed() {
            break;
        }
        if let Flow::Abort(reply) = filter.call(ctx).await? {
            return Ok(Some(reply));
        }
    }
    Ok(None)
}

/// Before-filters, then the action, converting returned errors into negotiated error responses.
pub async fn action_handler(ctx: &mut Context) {
    let def = ctx.controller_def();
    let name = ctx.action().to_string();
    let Some(action) = def.get_action(&name) else {
        ctx.respond_error(&AppError::ActionNotFound(name)).await;
        return;
    };
    match exec_filters(ctx, Phase::Before).await {
        Err(e) => {
            ctx.respond_error(&e).await;
            return;
        }
        Ok(Some(reply)) => {
            if let Err(e) = ctx.respond(reply.content, RespondOptions::status(reply.status)).await {
                ctx.respond_error(&e).await;
            }
            return;
        }
        Ok(None) => {}
    }
    if ctx.is_completed() {
        tracing::debug!(controller = %def.name(), action = %name, "before filters responded; action skipped");
        return;
    }
    match action.call(ctx).await {
        Ok(()) if !ctx.is_completed() => {
            let err = AppError::Internal(format!("{}#{} finished without responding", def.name(), name));
            ctx.respond_error(&err).await;
        }
        Ok(()) => {}
        Err(e) => ctx.respond_error(&e).await,
    }
}
