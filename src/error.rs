//! Error taxonomy surfaced to clients.
//!
//! Every failure that crosses back into the request layer is a [`ChatError`],
//! which knows its wire code, HTTP status and client-safe message. Internal
//! detail is kept for logs and for the diagnostic `detail` field of
//! streaming error frames, never for JSON error bodies.

use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::gate::GateError;
use crate::inference::backend::EngineError;

pub const INTERNAL_MESSAGE: &str = "An unexpected error occurred.";
pub const BUSY_MESSAGE: &str = "The chat service is busy. Please retry shortly.";

#[derive(Error, Debug)]
pub enum ChatError {
    /// Request body failed shape or range checks.
    #[error("Invalid request payload.")]
    Validation { details: Vec<Value> },

    /// The engine rejected the resolved arguments.
    #[error("{0}")]
    InvalidRequest(String),

    /// No admission permit within the queue timeout.
    #[error("{}", BUSY_MESSAGE)]
    ServerBusy,

    /// The engine returned something other than the expected shape.
    #[error("Malformed model response: {0}")]
    ModelResponse(String),

    /// Explicit rejection from the routing layer.
    #[error("{message}")]
    Http { status: StatusCode, message: String },

    /// Anything else.
    #[error("{}", INTERNAL_MESSAGE)]
    Internal { detail: String },
}

impl ChatError {
    pub fn internal(detail: impl Into<String>) -> Self {
        ChatError::Internal {
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation { .. } => "validation_error",
            ChatError::InvalidRequest(_) => "invalid_request",
            ChatError::ServerBusy => "server_busy",
            ChatError::ModelResponse(_) => "model_response_error",
            ChatError::Http { .. } => "http_error",
            ChatError::Internal { .. } => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::ModelResponse(_) => StatusCode::BAD_GATEWAY,
            ChatError::Http { status, .. } => *status,
            ChatError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic detail, only ever set for internal errors.
    pub fn detail(&self) -> Option<&str> {
        match self {
            ChatError::Internal { detail } => Some(detail),
            _ => None,
        }
    }
}

impl From<EngineError> for ChatError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidRequest(msg) => ChatError::InvalidRequest(msg),
            other => ChatError::internal(other.to_string()),
        }
    }
}

impl From<GateError> for ChatError {
    fn from(_: GateError) -> Self {
        ChatError::ServerBusy
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::internal(format!("engine worker failed: {e}"))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Serialize)]
struct ErrorDetails {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<Value>>,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Internal { detail } = &self {
            error!(detail = %detail, "Request failed with internal error");
        }
        let status = self.status();
        let body = ErrorResponse {
            error: ErrorDetails {
                code: self.code(),
                message: self.to_string(),
                details: match self {
                    ChatError::Validation { details } => Some(details),
                    _ => None,
                },
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Last-resort handler for panics escaping a route handler.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    ChatError::internal(detail).into_response()
}
