//! Error types for the deploy client.

use deploy_core::protocol::ItemError;
use deploy_core::CoreError;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Agent error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Too large: {0}")]
    Capacity(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Transient failures worth another attempt. Auth, validation and
    /// integrity failures are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) | ClientError::RateLimited { .. } => {
                true
            }
            ClientError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map a failed agent response onto the taxonomy.
    pub fn from_status(status: StatusCode, message: String, retry_after: Option<u64>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized(message),
            StatusCode::FORBIDDEN => ClientError::Forbidden(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ClientError::BadRequest(message)
            }
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::CONFLICT => ClientError::Conflict(message),
            StatusCode::PAYLOAD_TOO_LARGE => ClientError::Capacity(message),
            StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited {
                retry_after: retry_after.unwrap_or(1),
            },
            other => ClientError::Server {
                status: other.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_decode() {
            ClientError::Protocol(err.to_string())
        } else if err.is_builder() {
            ClientError::Config(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Aggregate outcome of a batch that continues past item failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, path: impl Into<String>, error: &ClientError) {
        self.failed += 1;
        self.errors.push(ItemError {
            path: path.into(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ClientError::Network("reset".into()).is_retryable());
        assert!(ClientError::Timeout("slow".into()).is_retryable());
        assert!(ClientError::RateLimited { retry_after: 3 }.is_retryable());
        assert!(ClientError::Server {
            status: 503,
            message: "maintenance".into()
        }
        .is_retryable());

        assert!(!ClientError::Unauthorized("bad token".into()).is_retryable());
        assert!(!ClientError::Forbidden("blocked".into()).is_retryable());
        assert!(!ClientError::BadRequest("missing path".into()).is_retryable());
        assert!(!ClientError::Integrity {
            path: "a".into(),
            expected: "x".into(),
            actual: "y".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, "no".into(), None),
            ClientError::Unauthorized(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into(), Some(42)),
            ClientError::RateLimited { retry_after: 42 }
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::PAYLOAD_TOO_LARGE, "big".into(), None),
            ClientError::Capacity(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_GATEWAY, "proxy".into(), None),
            ClientError::Server { status: 502, .. }
        ));
    }

    #[test]
    fn test_batch_report() {
        let mut report = BatchReport::default();
        report.record_success();
        report.record_failure("a.txt", &ClientError::NotFound("a.txt".into()));
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
        assert_eq!(report.errors[0].path, "a.txt");

        let mut total = BatchReport::default();
        total.merge(report);
        assert_eq!(total.failed, 1);
    }
}
