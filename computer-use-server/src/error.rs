//! Error types and the single failure-kind → HTTP mapping used by every handler.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use computer_use_shared::{ErrorBody, ErrorEnvelope};
use tracing::error;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors talking to the sandbox provisioning service.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Sandbox service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sandbox service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Sandbox {0} not found")]
    NotFound(String),

    #[error("Invalid response from sandbox service: {0}")]
    InvalidResponse(String),
}

/// Tool execution errors. These are reported back to the model as error
/// results, never to the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {0} is not registered")]
    Unknown(String),

    #[error("Invalid input for tool {name}: {reason}")]
    InvalidInput { name: String, reason: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provider stream failed: {0}")]
    Stream(String),

    #[error("Invalid provider payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Every way a request can fail before or while producing a response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(#[from] SandboxError),

    #[error("Provider call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request exceeded {0:?}")]
    TimedOut(Duration),
}

impl ApiError {
    /// Status code, client-facing message and OpenAI error type for each kind.
    fn disposition(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::SandboxUnavailable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to initialize computer environment",
                "internal_error",
            ),
            Self::Provider(_) | Self::MalformedRequest(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                "internal_error",
            ),
            Self::TimedOut(_) => (
                StatusCode::REQUEST_TIMEOUT,
                "Request timed out",
                "internal_error",
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.disposition().0
    }
}

/// Renders an [`ApiError`] as `{ "error": { "message", "type" } }`.
#[derive(Debug)]
pub struct OpenAiError(pub ApiError);

impl<E: Into<ApiError>> From<E> for OpenAiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for OpenAiError {
    fn into_response(self) -> Response {
        error!("OpenAI-compatible request failed: {}", self.0);
        let (status, message, kind) = self.0.disposition();
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: message.to_string(),
                kind: kind.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Renders an [`ApiError`] as the native `{ "error": "Internal Server Error" }`.
#[derive(Debug)]
pub struct NativeError(pub ApiError);

impl<E: Into<ApiError>> From<E> for NativeError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for NativeError {
    fn into_response(self) -> Response {
        error!("Chat API error: {}", self.0);
        let status = self.0.status();
        (
            status,
            Json(serde_json::json!({ "error": "Internal Server Error" })),
        )
            .into_response()
    }
}
