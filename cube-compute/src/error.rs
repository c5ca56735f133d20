//! Error types for the compute client

use thiserror::Error;

/// Result type alias for compute client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while driving a job on a compute resource
#[derive(Debug, Error)]
pub enum ClientError {
    /// The compute resource could not be reached
    #[error("compute resource unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// pfcon answered with a non-success status
    #[error("pfcon rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected pfcon response: {0}")]
    InvalidResponse(String),

    /// The job id is unknown to the compute resource
    #[error("job {0} not found on compute resource")]
    JobNotFound(String),

    /// No client is registered under the requested compute resource name
    #[error("unknown compute resource: {0}")]
    UnknownComputeResource(String),
}

impl ClientError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// The job is already gone from the compute resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_) | Self::Rejected { status: 404, .. }
        )
    }

    /// The cached auth token was refused
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Rejected { status: 401, .. })
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Rejected { status, .. } if *status >= 500)
    }
}
