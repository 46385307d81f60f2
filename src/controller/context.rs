use crate::case::underscore;
use crate::controller::{exec_filters, ControllerDef, Phase, Request};
use crate::error::AppError;
use crate::format::{FormatKind, Negotiated};
use crate::orm::{Model, Schema};
use crate::render::Helpers;
use crate::router::ParamMap;
use crate::session::Session;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Options for `Context::respond`.
#[derive(Clone, Debug)]
pub struct RespondOptions {
    pub status: StatusCode,
    /// Replaces the controller's format list for this response.
    pub formats: Option<Vec<String>>,
    /// Template path; defaults to `{controller}/{action}`.
    pub template: Option<String>,
    /// Render engine; defaults to the one registered for the format.
    pub engine: Option<String>,
}

impl Default for RespondOptions {
    fn default() -> Self {
        RespondOptions {
            status: StatusCode::OK,
            formats: None,
            template: None,
            engine: None,
        }
    }
}

impl RespondOptions {
    pub fn status(status: StatusCode) -> Self {
        RespondOptions {
            status,
            ..Default::default()
        }
    }

    pub fn formats(mut self, formats: &[&str]) -> Self {
        self.formats = Some(formats.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }
}

struct Sent {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// One request's view of a controller: request, params, session and the
/// response being built. `output` is the only exit and runs at most once.
pub struct Context {
    pub request: Request,
    pub session: Session,
    /// Scratch space shared between filters and the action.
    pub locals: Map<String, Value>,
    params: Map<String, Value>,
    controller: Arc<ControllerDef>,
    action: String,
    state: AppState,
    headers: HeaderMap,
    completed: bool,
    sent: Option<Sent>,
}

impl Context {
    pub fn new(state: AppState, controller: Arc<ControllerDef>, action: &str, request: Request, session: Session) -> Self {
        let params = request.merged_params();
        Context {
            request,
            session,
            locals: Map::new(),
            params,
            controller,
            action: action.to_string(),
            state,
            headers: HeaderMap::new(),
            completed: false,
            sent: None,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn controller_name(&self) -> &str {
        self.controller.name()
    }

    pub(crate) fn controller_def(&self) -> Arc<ControllerDef> {
        self.controller.clone()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn route_params(&self) -> &ParamMap {
        &self.request.route
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// A param as a string; numbers and booleans are stringified.
    pub fn param_str(&self, name: &str) -> Option<String> {
        match self.params.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Parse a JSON-encoded string param (e.g. `?where={"a":1}`).
    /// Missing params are `Ok(None)`; malformed ones a validation error.
    pub fn json_param(&self, name: &str) -> Result<Option<Value>, AppError> {
        match self.params.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| AppError::Validation(format!("param {} is not valid JSON: {}", name, e))),
            Some(other) => Ok(Some(other.clone())),
        }
    }

    pub fn schema(&self) -> Result<&Schema, AppError> {
        self.state
            .schema
            .as_ref()
            .ok_or_else(|| AppError::Internal("no schema configured".into()))
    }

    pub fn model(&self, name: &str) -> Result<Model, AppError> {
        self.schema()?.model(name)
    }

    /// URL of a named route.
    pub fn url_for(&self, name: &str, params: &ParamMap) -> Option<String> {
        self.state.router.read().url_for(name, params, false)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Header added to whatever response is eventually sent.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn template_path(&self) -> String {
        format!("{}/{}", underscore(self.controller.name()), self.action)
    }

    fn helpers(&self, format: &str) -> Helpers {
        let routes = self
            .state
            .router
            .read()
            .routes()
            .iter()
            .filter_map(|r| r.name.clone().map(|n| (n, r.pattern.clone())))
            .collect();
        Helpers {
            params: self.params.clone(),
            routes,
            flash: self.session.get("flash").cloned(),
            format: format.to_string(),
        }
    }

    /// A `format` param (URL suffix) picks the format directly; otherwise `Accept` decides.
    fn negotiate(&self, allowed: &[String]) -> Option<Negotiated> {
        match self.params.get("format").and_then(Value::as_str) {
            Some(name) => self.state.formats.by_name(name, allowed),
            None => self.state.formats.negotiate(self.request.accept(), allowed),
        }
    }

    /// Negotiate a format and send `content` through it. When no format fits,
    /// a 415 is sent instead and `Ok` is returned.
    pub async fn respond(&mut self, content: impl Serialize, options: RespondOptions) -> Result<(), AppError> {
        if self.completed {
            tracing::warn!(controller = %self.controller.name(), action = %self.action, "respond after the response was sent");
            return Ok(());
        }
        let content = serde_json::to_value(content).map_err(|e| AppError::Render(e.to_string()))?;
        let allowed = options
            .formats
            .clone()
            .unwrap_or_else(|| self.controller.formats().to_vec());
        let Some(negotiated) = self.negotiate(&allowed) else {
            tracing::debug!(accept = ?self.request.accept(), allowed = ?allowed, "no acceptable format");
            let err = AppError::UnsupportedFormat;
            self.output(err.status(), "text/plain", err.to_string().into_bytes()).await;
            return Ok(());
        };
        let body = match &negotiated.format.kind {
            FormatKind::Serialize(formatter) => formatter(&content, &self.params)?,
            FormatKind::Template | FormatKind::Report => {
                let template = options.template.clone().unwrap_or_else(|| self.template_path());
                let renderer = self
                    .state
                    .renderers
                    .resolve(&negotiated.format.name, options.engine.as_deref())?;
                let helpers = self.helpers(&negotiated.format.name);
                renderer.render(&template, &content, &helpers).await?
            }
        };
        self.output(options.status, &negotiated.content_type, body).await;
        Ok(())
    }

    pub async fn respond_status(&mut self, status: StatusCode, content: impl Serialize) -> Result<(), AppError> {
        self.respond(content, RespondOptions::status(status)).await
    }

    /// Send `err` as `{error: {type, message, stack, code}}`, negotiated over the
    /// controller's serializer formats; plain text when none fits.
    pub async fn respond_error(&mut self, err: &AppError) {
        let status = err.status();
        if self.completed {
            tracing::warn!(error = %err, "error after the response was sent");
            return;
        }
        if status.is_server_error() {
            tracing::error!(controller = %self.controller.name(), action = %self.action, error = %err, "request failed");
        } else {
            tracing::debug!(controller = %self.controller.name(), action = %self.action, error = %err, "request rejected");
        }
        let mut allowed: Vec<String> = self
            .controller
            .formats()
            .iter()
            .filter(|f| self.state.formats.get(f).is_some_and(|f| f.is_serializer()))
            .cloned()
            .collect();
        if allowed.is_empty() {
            allowed = vec!["json".into(), "txt".into()];
        }
        let negotiated = self
            .negotiate(&allowed)
            .or_else(|| self.state.formats.by_name("txt", &["txt".to_string()]));
        let (content_type, body) = match negotiated {
            Some(n) => {
                let content = if n.format.name == "txt" {
                    Value::String(err.to_string())
                } else {
                    json!({ "error": err.body() })
                };
                let body = match &n.format.kind {
                    FormatKind::Serialize(formatter) => formatter(&content, &self.params).ok(),
                    _ => None,
                };
                match body {
                    Some(b) => (n.content_type, b),
                    None => ("text/plain".to_string(), err.to_string().into_bytes()),
                }
            }
            None => ("text/plain".to_string(), err.to_string().into_bytes()),
        };
        self.output(status, &content_type, body).await;
    }

    pub async fn redirect(&mut self, url: &str) {
        match HeaderValue::from_str(url) {
            Ok(v) => {
                self.headers.insert(header::LOCATION, v);
                self.output(StatusCode::FOUND, "text/plain", Vec::new()).await;
            }
            Err(_) => {
                let err = AppError::Internal(format!("invalid redirect target {}", url));
                self.respond_error(&err).await;
            }
        }
    }

    pub async fn not_found(&mut self, message: &str) {
        self.respond_error(&AppError::NotFound(message.to_string())).await;
    }

    pub async fn forbidden(&mut self, message: &str) {
        self.respond_error(&AppError::Forbidden(message.to_string())).await;
    }

    /// The single exit point. Persists the session, fixes the response, then
    /// runs after-filters. Later calls only log a warning. HEAD and OPTIONS
    /// responses carry no body.
    pub async fn output(&mut self, status: StatusCode, content_type: &str, body: Vec<u8>) {
        if self.completed {
            tracing::warn!(controller = %self.controller.name(), action = %self.action, "output called twice; ignored");
            return;
        }
        self.completed = true;
        let persist = self.session.is_persistent();
        if persist {
            self.session.touch();
            if let Err(e) = self.session.save().await {
                tracing::error!(error = %e, "session save failed");
            }
        }
        let mut headers = std::mem::take(&mut self.headers);
        let content_type = if content_type.contains("charset=") {
            content_type.to_string()
        } else {
            format!("{}; charset={}", content_type, self.state.settings.charset)
        };
        if let Ok(v) = HeaderValue::from_str(&content_type) {
            headers.insert(header::CONTENT_TYPE, v);
        }
        if persist {
            if let Ok(v) = HeaderValue::from_str(&self.session.cookie(&self.state.settings.session_cookie)) {
                headers.append(header::SET_COOKIE, v);
            }
        }
        let bodiless = self.request.method == Method::HEAD || self.request.method == Method::OPTIONS;
        self.sent = Some(Sent {
            status,
            headers,
            body: if bodiless { Bytes::new() } else { Bytes::from(body) },
        });
        tracing::debug!(controller = %self.controller.name(), action = %self.action, status = status.as_u16(), "response sent");
        if let Err(e) = exec_filters(self, Phase::After).await {
            tracing::warn!(controller = %self.controller.name(), action = %self.action, error = %e, "after filter failed");
        }
    }

    /// The finished response; a 500 when nothing was sent.
    pub fn into_response(self) -> Response {
        match self.sent {
            Some(sent) => {
                let mut res = Response::new(Body::from(sent.body));
                *res.status_mut() = sent.status;
                *res.headers_mut() = sent.headers;
                res
            }
            None => {
                let mut res = Response::new(Body::from("no response"));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        }
    }
}
