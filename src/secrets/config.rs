//! Secret store configuration.

use serde::{Deserialize, Serialize};

use crate::oauth::config::is_http_url;

/// Vault-compatible secret store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretStoreConfig {
    /// Enable pre-spawn secret retrieval.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the store. Example: "https://vault.example.com"
    #[serde(default)]
    pub url: String,

    /// JWT auth role. `None` uses the mount's default role.
    #[serde(default)]
    pub role: Option<String>,

    /// Mount of the JWT auth method.
    #[serde(default = "default_jwt_mount")]
    pub jwt_mount: String,

    /// Mount of the KV v2 engine holding per-user secrets.
    #[serde(default = "default_kv_mount")]
    pub kv_mount: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_jwt_mount() -> String {
    "jwt".to_string()
}

fn default_kv_mount() -> String {
    "valeria".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            role: None,
            jwt_mount: default_jwt_mount(),
            kv_mount: default_kv_mount(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SecretStoreConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        if self.url.is_empty() {
            return Err("Secret store URL is required".to_string());
        }

        if !is_http_url(&self.url) {
            return Err("Secret store URL must be a valid HTTP(S) URL".to_string());
        }

        if self.jwt_mount.is_empty() || self.kv_mount.is_empty() {
            return Err("Secret store mounts must not be empty".to_string());
        }

        Ok(())
    }

    pub(crate) fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}
