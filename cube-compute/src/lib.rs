//! Cube Compute Client
//!
//! Contract between the execution engine and the remote compute resources
//! that run plugin containers, plus an HTTP implementation for pfcon
//! services.
//!
//! # Example
//!
//! ```no_run
//! use cube_compute::{ComputeClient, PfconClient};
//!
//! # async fn example() -> cube_compute::Result<()> {
//! let client = PfconClient::new("http://localhost:30005/api/v1")
//!     .with_credentials("pfcon", "pfcon1234");
//!
//! let report = client.poll("chris-jid-42").await?;
//! println!("job is {:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod jobs;
mod registry;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use registry::ComputeRegistry;

use async_trait::async_trait;
use cube_core::dto::compute::{JobDescriptor, JobRef, JobStatusReport};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

/// Operations the engine needs from a compute resource
///
/// Every call is keyed by the job id the engine chose at submission time.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Submit a new job
    async fn submit(&self, job: &JobDescriptor) -> Result<JobRef>;

    /// Fetch the current status of a job
    async fn poll(&self, jid: &str) -> Result<JobStatusReport>;

    /// Ask the compute resource to stop a running job
    async fn cancel(&self, jid: &str) -> Result<()>;

    /// Remove every trace of a job from the compute resource
    async fn delete(&self, jid: &str) -> Result<()>;
}

/// HTTP client for a pfcon compute resource
///
/// When credentials are configured, an auth token is requested on first use
/// and cached until the service rejects it.
#[derive(Debug)]
pub struct PfconClient {
    /// Base URL of the pfcon API (e.g., "http://pfcon:30005/api/v1")
    base_url: String,
    /// HTTP client instance
    client: Client,
    credentials: Option<(String, String)>,
    token: Mutex<Option<String>>,
}

impl PfconClient {
    /// Create a new pfcon client
    ///
    /// # Example
    /// ```
    /// use cube_compute::PfconClient;
    ///
    /// let client = PfconClient::new("http://localhost:30005/api/v1/");
    /// assert_eq!(client.base_url(), "http://localhost:30005/api/v1");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new pfcon client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials: None,
            token: Mutex::new(None),
        }
    }

    /// Authenticate every request with a token obtained from these credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// Get the base URL of the compute resource
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                *self.token.lock().await = None;
            }
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}
