//! Error taxonomy for the deploy agent.
//!
//! Every variant maps to one HTTP status; the response body is the shared
//! `{success: false, error}` envelope.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use deploy_core::protocol::ErrorBody;
use deploy_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("IP address {0} is not allowed")]
    IpBlocked(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Maintenance mode: {0}")]
    Maintenance(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            AgentError::IpBlocked(_) | AgentError::Forbidden(_) => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) => StatusCode::CONFLICT,
            AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AgentError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AgentError::Maintenance(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Config(_)
            | AgentError::Io(_)
            | AgentError::Serialization(_)
            | AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a filesystem error on a named path to the matching class.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AgentError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => {
                AgentError::Conflict(format!("{path} already exists"))
            }
            std::io::ErrorKind::PermissionDenied => {
                AgentError::Forbidden(format!("permission denied: {path}"))
            }
            _ => AgentError::Io(err),
        }
    }
}

impl From<CoreError> for AgentError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Io(e) => AgentError::Io(e),
            CoreError::Serialization(e) => AgentError::Serialization(e),
            CoreError::InvalidPath(p) => AgentError::BadRequest(format!("invalid path: {p}")),
            CoreError::BackupNotFound(id) => AgentError::NotFound(format!("backup {id}")),
            CoreError::InvalidManifest(m) => AgentError::Internal(m),
            CoreError::Walk(e) => AgentError::Internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(err: tokio::task::JoinError) -> Self {
        AgentError::Internal(format!("worker task failed: {err}"))
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let retry_after = match &self {
            AgentError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };

        let body = ErrorBody {
            success: false,
            error: message,
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
