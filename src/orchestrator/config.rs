//! Orchestration API configuration.

use serde::{Deserialize, Serialize};

use crate::oauth::config::is_http_url;

/// REST orchestration API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Base URL. Example: "http://session-api.hub.svc:8080"
    #[serde(default)]
    pub url: String,

    /// Optional bearer token for the API.
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Orchestrator URL is required".to_string());
        }

        if !is_http_url(&self.url) {
            return Err("Orchestrator URL must be a valid HTTP(S) URL".to_string());
        }

        Ok(())
    }
}
