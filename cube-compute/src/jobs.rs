//! Job endpoints of the pfcon API

use async_trait::async_trait;
use cube_core::dto::compute::{JobDescriptor, JobRef, JobStatusReport};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::{ComputeClient, PfconClient};

#[derive(Serialize)]
struct TokenRequest<'a> {
    pfcon_user: &'a str,
    pfcon_password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// pfcon wraps the job status in a `compute` envelope
#[derive(Deserialize)]
struct JobResponse {
    compute: JobStatusReport,
}

impl PfconClient {
    // =============================================================================
    // Authentication
    // =============================================================================

    /// Cached token, requesting a new one when none is held
    async fn token(&self) -> Result<Option<String>> {
        let Some((user, password)) = &self.credentials else {
            return Ok(None);
        };

        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            return Ok(Some(t.clone()));
        }

        let url = format!("{}/auth-token/", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&TokenRequest {
                pfcon_user: user,
                pfcon_password: password,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(format!("token: {}", e)))?;

        debug!("Obtained auth token from {}", self.base_url);
        *token = Some(body.token.clone());
        Ok(Some(body.token))
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match self.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    fn job_url(&self, jid: &str) -> String {
        format!("{}/jobs/{}/", self.base_url, jid)
    }
}

#[async_trait]
impl ComputeClient for PfconClient {
    async fn submit(&self, job: &JobDescriptor) -> Result<JobRef> {
        let url = format!("{}/jobs/", self.base_url);
        let request = self.authorized(self.client.post(&url).json(job)).await?;
        let response = request.send().await?;

        let body: JobResponse = self.handle_response(response).await?;
        info!(
            "Submitted job {} to {} (status: {:?})",
            job.jid, self.base_url, body.compute.status
        );

        Ok(JobRef { jid: job.jid.clone() })
    }

    async fn poll(&self, jid: &str) -> Result<JobStatusReport> {
        let request = self.authorized(self.client.get(self.job_url(jid))).await?;
        let response = request.send().await?;

        let body: JobResponse = self.handle_response(response).await?;
        Ok(body.compute)
    }

    async fn cancel(&self, jid: &str) -> Result<()> {
        let url = format!("{}cancel/", self.job_url(jid));
        let request = self.authorized(self.client.post(&url)).await?;
        let response = request.send().await?;

        self.handle_empty_response(response).await
    }

    async fn delete(&self, jid: &str) -> Result<()> {
        let request = self.authorized(self.client.delete(self.job_url(jid))).await?;
        let response = request.send().await?;

        self.handle_empty_response(response).await
    }
}
