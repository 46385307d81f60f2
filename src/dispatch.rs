//! Entry point for every request: route, build the controller context, run the action.

use crate::controller::{action_handler, ControllerDef, Context, CorsFilter, Request};
use crate::error::AppError;
use crate::router::ParamValue;
use crate::session::{cookie_value, Session};
use crate::state::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;

/// Stand-in controller for errors raised before a controller is known.
fn fallback_controller() -> Arc<ControllerDef> {
    Arc::new(ControllerDef::new("Application").responds_with(&["json", "txt"]))
}

enum Target {
    Controller(Arc<ControllerDef>, String),
    Error(AppError),
    Preflight(Vec<Method>),
}

fn resolve(state: &AppState, request: &mut Request) -> Target {
    let router = state.router.read();
    let path = request.path().to_string();
    let Some(matched) = router.match_route(&path, &request.method) else {
        if request.method == Method::OPTIONS {
            let allowed: Vec<Method> = router
                .routes()
                .iter()
                .filter(|r| r.captures(&path).is_some())
                .flat_map(|r| r.methods.clone())
                .collect();
            if !allowed.is_empty() {
                return Target::Preflight(allowed);
            }
        }
        return Target::Error(AppError::RouteNotFound);
    };
    let Some(controller) = matched.controller().map(str::to_string) else {
        return Target::Error(AppError::RouteNotFound);
    };
    let action = matched.action().unwrap_or("index").to_string();
    request.route = matched.params;
    match state.controller(&controller) {
        Some(def) => Target::Controller(def, action),
        None => Target::Error(AppError::ControllerNotFound(controller)),
    }
}

pub async fn dispatch(State(state): State<AppState>, req: axum::extract::Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = handle(state, req).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn handle(state: AppState, req: axum::extract::Request) -> Response {
    let cookie = cookie_value(req.headers(), &state.settings.session_cookie);
    let session = match Session::open(state.sessions.clone(), cookie, state.settings.session_max_age).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "session load failed; starting a new session");
            match Session::open(state.sessions.clone(), None, state.settings.session_max_age).await {
                Ok(s) => s,
                Err(e) => return e.into_response(),
            }
        }
    };
    let (uri, headers) = (req.uri().clone(), req.headers().clone());
    let mut request = match Request::read(req).await {
        Ok(r) => r,
        Err(e) => return error_only(state, session, uri, headers, e).await,
    };
    match resolve(&state, &mut request) {
        Target::Controller(def, action) => {
            if let Some(ParamValue::Str(c)) = request.route.get("controller") {
                tracing::debug!(controller = %c, action = %action, "dispatch");
            }
            let mut ctx = Context::new(state, def, &action, request, session);
            action_handler(&mut ctx).await;
            ctx.into_response()
        }
        Target::Preflight(methods) => preflight(&state, &methods),
        Target::Error(e) => {
            let mut ctx = Context::new(state, fallback_controller(), "", request, session);
            ctx.respond_error(&e).await;
            ctx.into_response()
        }
    }
}

/// Errors from reading the request, before anything could be routed.
async fn error_only(state: AppState, session: Session, uri: Uri, headers: HeaderMap, err: AppError) -> Response {
    let request = Request {
        method: Method::GET,
        original_method: Method::GET,
        uri,
        headers,
        query: Default::default(),
        body: Default::default(),
        route: Default::default(),
    };
    let mut ctx = Context::new(state, fallback_controller(), "", request, session);
    ctx.respond_error(&err).await;
    ctx.into_response()
}

/// `OPTIONS` for a path whose routes use other methods.
fn preflight(state: &AppState, methods: &[Method]) -> Response {
    let mut names: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
    if names.iter().any(|m| m == "GET") {
        names.push("HEAD".into());
    }
    names.push("OPTIONS".into());
    names.sort();
    names.dedup();
    let mut res = StatusCode::NO_CONTENT.into_response();
    if let Ok(v) = HeaderValue::from_str(&names.join(", ")) {
        res.headers_mut().insert(header::ALLOW, v);
    }
    if let Some(origin) = &state.settings.cors_origin {
        if let Ok(cors) = CorsFilter::new(origin) {
            res.headers_mut().extend(cors.headers());
        }
    }
    res
}
