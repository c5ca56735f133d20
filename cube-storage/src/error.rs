//! Error types for storage backends

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur when talking to a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object or path exists at the given location
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object key cannot be mapped onto the backend
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The object store answered with an error status
    #[error("Object store error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a response from the object store
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Backend misconfiguration
    #[error("Invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::ApiError { status: 404, .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Io(_) | Self::ParseError(_) => !self.is_not_found(),
            Self::ApiError { status, .. } => *status >= 500 || *status == 401 || *status == 429,
            Self::NotFound(_) | Self::InvalidKey(_) | Self::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(StorageError::NotFound("a".into()).is_not_found());
        assert!(StorageError::api_error(404, "missing").is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StorageError::Io(io).is_not_found());
        assert!(!StorageError::api_error(500, "boom").is_not_found());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::api_error(503, "busy").is_transient());
        assert!(StorageError::api_error(401, "expired").is_transient());
        assert!(!StorageError::api_error(404, "missing").is_transient());
        assert!(!StorageError::api_error(403, "denied").is_transient());
        assert!(!StorageError::InvalidKey("../x".into()).is_transient());
    }
}
