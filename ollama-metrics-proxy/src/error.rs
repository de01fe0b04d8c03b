//! Error types for the metrics proxy.
//!
//! Every error carries a short machine-readable reason tag. The tag labels the
//! `errors_total` metric and is echoed as `error.code` in compatible-dialect
//! bodies, so failure causes can be queried without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::queue::QueueError;

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Inbound body could not be parsed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Admission control or caller context failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Backend could not be reached
    #[error("Failed to connect to Ollama: {0}")]
    BackendUnreachable(String),

    /// Backend did not answer within the client timeout
    #[error("Ollama request timed out: {0}")]
    BackendTimeout(String),

    /// Backend answered with a non-2xx status
    #[error("Ollama returned status {status}: {body}")]
    BackendStatus { status: u16, body: String },

    /// Backend response body could not be read
    #[error("Failed to read Ollama response: {0}")]
    ReadResponse(String),

    /// Backend response body could not be decoded
    #[error("Failed to parse Ollama response: {0}")]
    ParseResponse(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which wire dialect an error body is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `{"error": "message"}`
    Native,
    /// `{"error": {"message", "type", "code"}}`
    Compatible,
}

impl ProxyError {
    /// Short tag used as the `error_type` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "parse_request",
            ProxyError::Queue(e) => e.reason(),
            ProxyError::BackendUnreachable(_) => "backend_unreachable",
            ProxyError::BackendTimeout(_) => "backend_timeout",
            ProxyError::BackendStatus { .. } => "backend_status",
            ProxyError::ReadResponse(_) => "read_response",
            ProxyError::ParseResponse(_) => "parse_response",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// HTTP status returned to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Queue(e) => match e {
                QueueError::QueueFull { .. } | QueueError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                // nginx's "client closed request"; the caller rarely sees it
                QueueError::Cancelled => {
                    StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
                }
                QueueError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
                QueueError::ShutdownTimeout { .. } | QueueError::WorkLost => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ProxyError::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BackendStatus { status, .. } => backend_status(*status),
            ProxyError::ReadResponse(_) | ProxyError::ParseResponse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Queue internals are not exposed.
    fn public_message(&self) -> String {
        match self {
            ProxyError::Queue(QueueError::QueueFull { .. }) => {
                "Server is at capacity, retry later".to_string()
            }
            ProxyError::Queue(QueueError::ShutdownTimeout { .. } | QueueError::WorkLost) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// OpenAI-style error `type` field.
    fn compatible_type(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::SERVICE_UNAVAILABLE => "server_overloaded",
            s if s.is_client_error() => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// Render the error in the caller's dialect.
    pub fn into_dialect_response(self, dialect: Dialect) -> Response {
        let status = self.status();
        let message = self.public_message();

        let body = match dialect {
            Dialect::Native => json!({ "error": message }),
            Dialect::Compatible => json!({
                "error": {
                    "message": message,
                    "type": self.compatible_type(),
                    "code": self.reason(),
                }
            }),
        };

        (status, Json(body)).into_response()
    }
}

/// Backend 4xx statuses are meaningful to the caller; 503 means the backend is
/// overloaded; anything else becomes a gateway error.
fn backend_status(status: u16) -> StatusCode {
    match StatusCode::from_u16(status) {
        Ok(s) if s.is_client_error() => s,
        Ok(StatusCode::SERVICE_UNAVAILABLE) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_dialect_response(Dialect::Compatible)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::BackendTimeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ProxyError::BackendUnreachable(e.to_string())
        } else if e.is_decode() {
            ProxyError::ParseResponse(e.to_string())
        } else {
            ProxyError::ReadResponse(e.to_string())
        }
    }
}
