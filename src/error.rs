//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Boot-time errors: model definitions and route table checks.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("controller {controller} has no action '{action}'")]
    MissingAction { controller: String, action: String },
    #[error("invalid id field: model {model} field {field}")]
    InvalidIdField { model: String, field: String },
    #[error("duplicate name: {0}")]
    Duplicate(String),
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Route not found")]
    RouteNotFound,
    #[error("Controller class not found: {0}")]
    ControllerNotFound(String),
    #[error("Action not found: {0}")]
    ActionNotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("Unsupported Media Type")]
    UnsupportedFormat,
    #[error("database: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("backend: {0}")]
    Backend(String),
    #[error("render: {0}")]
    Render(String),
    #[error("session: {0}")]
    Session(String),
    #[error("authentication: {0}")]
    Auth(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::RouteNotFound
            | AppError::ControllerNotFound(_)
            | AppError::ActionNotFound(_)
            | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Persistence(e) => {
                if let sqlx::Error::RowNotFound = e {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Backend(_) | AppError::Render(_) | AppError::Session(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short type tag sent as `type` in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "ConfigError",
            AppError::RouteNotFound | AppError::ControllerNotFound(_) | AppError::ActionNotFound(_) => {
                "RoutingError"
            }
            AppError::Validation(_) | AppError::BadRequest(_) => "ValidationError",
            AppError::UnsupportedFormat => "UnsupportedFormatError",
            AppError::Persistence(_) | AppError::Backend(_) => "PersistenceError",
            AppError::Render(_) => "RenderError",
            AppError::Session(_) => "SessionError",
            AppError::Auth(_) => "AuthenticationError",
            AppError::Forbidden(_) => "ForbiddenError",
            AppError::NotFound(_) => "NotFoundError",
            AppError::Internal(_) => "UncaughtException",
        }
    }

    /// `{type, message, stack, code}` object delivered through content negotiation.
    pub fn body(&self) -> ErrorBody {
        let mut stack = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(e) = source {
            stack.push(e.to_string());
            source = e.source();
        }
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            stack,
            code: self.status().as_u16(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
    pub code: u16,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorEnvelope { error: self.body() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_map_to_404() {
        assert_eq!(AppError::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::ControllerNotFound("User".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::ActionNotFound("zap".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn body_carries_type_and_code() {
        let body = AppError::Internal("boom".into()).body();
        assert_eq!(body.kind, "UncaughtException");
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "internal: boom");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "UncaughtException");
    }

    #[test]
    fn config_error_stack_lists_sources() {
        let err = AppError::from(ConfigError::Duplicate("User".into()));
        let body = err.body();
        assert_eq!(body.kind, "ConfigError");
        assert_eq!(body.message, "duplicate name: User");
    }
}
