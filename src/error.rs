use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::domain::Platform;

/// Error taxonomy for the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Client validation failed. Only Claude Code and Codex clients are allowed.")]
    ValidationRejected,

    #[error("No available accounts for platform: {0}")]
    NoCandidates(Platform),

    #[error("No account supports model: {0}")]
    NoModelSupport(String),

    #[error("Retry exhausted: {0}")]
    RetryExhausted(Box<RelayError>),

    #[error("Upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Repository error: {0}")]
    Repository(String),
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RelayError {
    /// Maps each variant to its documented HTTP error response. Kinds with
    /// no dedicated mapping (repository/transport failures on critical
    /// paths) fall back to a 500 carrying the error's message.
    pub fn status_and_body(&self) -> (StatusCode, serde_json::Value) {
        match self {
            RelayError::ValidationRejected => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Client validation failed. Only Claude Code and Codex clients are allowed." }),
            ),
            RelayError::NoCandidates(_) | RelayError::NoModelSupport(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "No available accounts for this request" }),
            ),
            RelayError::RetryExhausted(inner) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": format!("No available accounts for this request: {inner}") }),
            ),
            RelayError::UpstreamStatus { message, .. }
            | RelayError::UpstreamTransport(message)
            | RelayError::Stream(message)
            | RelayError::Repository(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}
