//! Error types for adapters.

use thiserror::Error;

/// Errors that can occur when talking to a backend or the status interface.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP request failed before a status code was received.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Failed to parse a response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Timeout waiting for response.
    #[error("Request timed out")]
    Timeout,

    /// The backend answered with a server error (HTTP 500).
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused some of the records in the payload (HTTP 400 or
    /// per-item bulk errors).
    #[error("Backend rejected records: {0}")]
    Rejected(String),

    /// Any other non-success status code.
    #[error("Backend returned status {0}")]
    Status(u16),

    /// Invalid adapter configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AdapterError {
    /// True when the payload should be split up to find bad records.
    pub fn is_rejected(&self) -> bool {
        matches!(self, AdapterError::Rejected(_))
    }

    /// True when the failure says the backend itself is not reachable or
    /// not healthy, so liveness must be re-established before resending.
    pub fn is_backend_down(&self) -> bool {
        matches!(
            self,
            AdapterError::Connection(_) | AdapterError::Timeout | AdapterError::Unavailable(_)
        )
    }

    /// Classify an HTTP status code. Returns `None` for success.
    pub fn from_status(status: u16, body: &str) -> Option<Self> {
        match status {
            200..=299 => None,
            400 => Some(AdapterError::Rejected(body.trim().to_string())),
            500 => Some(AdapterError::Unavailable(body.trim().to_string())),
            other => Some(AdapterError::Status(other)),
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => AdapterError::Timeout,
            _ => AdapterError::Connection(err.to_string()),
        }
    }
}

#[cfg(any(feature = "influx", feature = "elasticsearch"))]
impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_connect() {
            AdapterError::Connection(err.to_string())
        } else {
            AdapterError::Http(err.to_string())
        }
    }
}
