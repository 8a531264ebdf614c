//! HTTP client for the identity provider's token and user-info endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::config::{ProviderConfig, UserdataMethod, UserdataTokenMethod};
use super::refresher::TokenExchange;
use super::token::TokenResponse;
use crate::error::AuthError;

/// reqwest-backed [`TokenExchange`].
pub struct HttpTokenExchange {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.tls_verify)
            .user_agent("JupyterHub")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    /// 400 and 401 from the token endpoint map to `IdentityRejected`; other
    /// error statuses are `TransportFailure`.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        debug!(url = %self.config.token_url, "Exchanging refresh token");

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http_client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::transport(format!("token endpoint: {}", e)))?;

        match response.status() {
            status if status.is_success() => response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AuthError::malformed(format!("token response: {}", e))),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(AuthError::rejected(format!(
                "token endpoint refused refresh token ({})",
                response.status()
            ))),
            status => Err(AuthError::transport(format!(
                "token endpoint returned status {}",
                status
            ))),
        }
    }

    async fn fetch_user_info(
        &self,
        token_type: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, AuthError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if self.config.userdata_token_method == UserdataTokenMethod::Url {
            query.push(("access_token", access_token));
        }

        let request = match self.config.userdata_method {
            UserdataMethod::Get => self.http_client.get(&self.config.userdata_url),
            UserdataMethod::Post => self.http_client.post(&self.config.userdata_url),
        };

        let response = request
            .query(&query)
            .header("Accept", "application/json")
            .header("Authorization", format!("{} {}", token_type, access_token))
            .send()
            .await
            .map_err(|e| AuthError::transport(format!("userdata endpoint: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::transport(format!(
                "userdata endpoint returned status {}",
                response.status()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AuthError::malformed(format!("userdata response: {}", e)))
    }
}
