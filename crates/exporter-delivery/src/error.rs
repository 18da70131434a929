//! Error types for delivery and spooling.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use exporter_core::recovery::Retryable;
use exporter_transform::TransformError;
use thiserror::Error;

use crate::retry_policy;

/// Transport-level failure class for a request that got no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorCode {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Dns,
    /// Any other failure without a response
    Other,
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::Timeout => "ETIMEDOUT",
            Self::Dns => "ENOTFOUND",
            Self::Other => "ENETWORK",
        };
        f.write_str(code)
    }
}

/// One failed POST, classified once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    /// No response was received
    #[error("network error ({code}): {message}")]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    /// The partner API answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// Parsed `Retry-After` header
        retry_after: Option<Duration>,
    },
}

impl SendError {
    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self::Network {
            code,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after,
        }
    }

    /// Classify a reqwest failure that produced no response.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = error_chain(err);
        let code = if err.is_timeout() {
            NetworkErrorCode::Timeout
        } else if err.is_connect() {
            let lower = message.to_lowercase();
            if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
                NetworkErrorCode::Dns
            } else if lower.contains("reset") {
                NetworkErrorCode::ConnectionReset
            } else {
                NetworkErrorCode::ConnectionRefused
            }
        } else if message.to_lowercase().contains("reset") {
            NetworkErrorCode::ConnectionReset
        } else {
            NetworkErrorCode::Other
        };

        Self::Network { code, message }
    }

    /// HTTP status, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Network { .. } => None,
        }
    }
}

impl Retryable for SendError {
    fn is_retryable(&self) -> bool {
        retry_policy::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        retry_policy::retry_after(self)
    }
}

/// Render an error and its sources as one line.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Spool and failed-directory errors.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Filesystem error
    #[error("spool I/O error {operation}: {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not serialize a spool file
    #[error("spool JSON error for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A file on disk is unreadable or fails schema validation
    #[error("corrupted spool file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// A batch key or file name that could escape the spool directory
    #[error("invalid spool key or file name: {0:?}")]
    InvalidKey(String),

    /// No spool or failed file with this key or name
    #[error("spool file not found: {0}")]
    NotFound(String),
}

impl SpoolError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the sender.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The partner API refused the batch (400/401/403/404); never retried or spooled
    #[error("batch rejected by partner API (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Delivery did not succeed and the batch was not spooled (manual resend)
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    Undelivered {
        attempts: u32,
        #[source]
        source: SendError,
    },

    #[error(transparent)]
    Spool(#[from] SpoolError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl DeliveryError {
    /// Build from a final send error: terminal client errors become `Rejected`.
    pub fn from_send_error(err: SendError, attempts: u32) -> Self {
        match err {
            SendError::Http {
                status, message, ..
            } if retry_policy::is_non_retryable_status(status) => Self::Rejected { status, message },
            other => Self::Undelivered {
                attempts,
                source: other,
            },
        }
    }
}

/// Result alias for spool operations.
pub type SpoolResult<T> = std::result::Result<T, SpoolError>;

/// Result alias for sender operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        let err = SendError::network(NetworkErrorCode::ConnectionRefused, "connection refused");
        assert_eq!(err.to_string(), "network error (ECONNREFUSED): connection refused");

        let err = SendError::http(503, "unavailable", None);
        assert_eq!(err.to_string(), "HTTP 503: unavailable");
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_from_send_error_rejected() {
        let err = DeliveryError::from_send_error(SendError::http(401, "bad token", None), 1);
        assert!(matches!(err, DeliveryError::Rejected { status: 401, .. }));

        let err = DeliveryError::from_send_error(SendError::http(503, "down", None), 4);
        assert!(matches!(err, DeliveryError::Undelivered { attempts: 4, .. }));
    }
}
