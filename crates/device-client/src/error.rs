//! Device client errors

use thiserror::Error;

/// Errors that can occur when talking to a device through the proxy
#[derive(Debug, Error)]
pub enum DeviceError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Device or proxy could not be reached
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Proxy returned an unexpected status
    #[error("Device API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Device or endpoint not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Device refused the request as malformed or unsupported
    #[error("Rejected by device: {0}")]
    Rejected(String),

    /// Authentication failed (invalid token, expired, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeviceError {
    /// Classifies a transport failure from reqwest.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DeviceError::Timeout(error.to_string())
        } else if error.is_connect() {
            DeviceError::Unreachable(error.to_string())
        } else {
            DeviceError::Http(error)
        }
    }

    /// Whether retrying the same request later may succeed.
    ///
    /// I/O-class failures are retryable; a rejected or undecodable request
    /// will fail the same way until the input changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Http(_)
            | DeviceError::Timeout(_)
            | DeviceError::Unreachable(_)
            | DeviceError::NotFound(_) => true,
            DeviceError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            DeviceError::Rejected(_)
            | DeviceError::Authentication(_)
            | DeviceError::Serialization(_) => false,
        }
    }
}
