//! REST client for the orchestration platform.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::config::OrchestratorConfig;
use super::{LiveSession, Orchestrator};
use crate::session::SessionHandle;
use crate::spawn::LaunchSpec;

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    user: &'a str,
    spec: &'a LaunchSpec,
    /// The platform expects the "<n>M" notation.
    mem_limit: String,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    id: String,
}

/// reqwest-backed [`Orchestrator`].
pub struct HttpOrchestrator {
    base_url: String,
    api_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpOrchestrator {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            http_client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn create_session(&self, user_id: &str, spec: &LaunchSpec) -> Result<SessionHandle> {
        let body = CreateSessionRequest {
            user: user_id,
            spec,
            mem_limit: spec.mem_limit(),
        };

        let response = self
            .authorize(self.http_client.post(format!("{}/sessions", self.base_url)))
            .json(&body)
            .send()
            .await
            .context("Failed to reach orchestrator")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Orchestrator refused session for {}: status {}",
                user_id,
                response.status()
            ));
        }

        let created: CreateSessionResponse = response
            .json()
            .await
            .context("Failed to parse create-session response")?;

        debug!(user = %user_id, handle = %created.id, "Session created");
        Ok(SessionHandle(created.id))
    }

    async fn terminate_session(&self, handle: &SessionHandle) -> Result<()> {
        let response = self
            .authorize(
                self.http_client
                    .delete(format!("{}/sessions/{}", self.base_url, handle.as_str())),
            )
            .send()
            .await
            .context("Failed to reach orchestrator")?;

        match response.status() {
            // Already gone counts as terminated
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(anyhow!(
                "Orchestrator refused termination of {}: status {}",
                handle,
                status
            )),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<LiveSession>> {
        let response = self
            .authorize(self.http_client.get(format!("{}/sessions", self.base_url)))
            .send()
            .await
            .context("Failed to reach orchestrator")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Orchestrator session listing returned status {}",
                response.status()
            ));
        }

        response
            .json::<Vec<LiveSession>>()
            .await
            .context("Failed to parse session listing")
    }
}
