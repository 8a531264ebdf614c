//! Identity provider configuration.

use serde::{Deserialize, Serialize};

/// How the user-info endpoint is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserdataMethod {
    Get,
    Post,
}

impl std::str::FromStr for UserdataMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(UserdataMethod::Get),
            "POST" => Ok(UserdataMethod::Post),
            other => Err(format!("unsupported userdata method: {}", other)),
        }
    }
}

/// Where the access token goes on the user-info call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserdataTokenMethod {
    /// Authorization header only.
    Header,
    /// Authorization header plus `access_token` query parameter.
    Url,
}

impl std::str::FromStr for UserdataTokenMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "header" => Ok(UserdataTokenMethod::Header),
            "url" => Ok(UserdataTokenMethod::Url),
            other => Err(format!("unsupported userdata token method: {}", other)),
        }
    }
}

/// OAuth 2.0 provider configuration used for token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Token endpoint (refresh_token grant).
    /// Example: "https://sso.example.com/auth/realms/hub/protocol/openid-connect/token"
    #[serde(default)]
    pub token_url: String,

    /// User-info endpoint queried after each refresh.
    #[serde(default)]
    pub userdata_url: String,

    #[serde(default = "default_userdata_method")]
    pub userdata_method: UserdataMethod,

    #[serde(default = "default_userdata_token_method")]
    pub userdata_token_method: UserdataTokenMethod,

    /// Key in the user-info response holding the username.
    #[serde(default = "default_username_key")]
    pub username_key: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Verify the provider's TLS certificate.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Timeout for each provider request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_userdata_method() -> UserdataMethod {
    UserdataMethod::Get
}

fn default_userdata_token_method() -> UserdataTokenMethod {
    UserdataTokenMethod::Header
}

fn default_username_key() -> String {
    "preferred_username".to_string()
}

fn default_tls_verify() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            userdata_url: String::new(),
            userdata_method: default_userdata_method(),
            userdata_token_method: default_userdata_token_method(),
            username_key: default_username_key(),
            client_id: String::new(),
            client_secret: String::new(),
            tls_verify: default_tls_verify(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProviderConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_url.is_empty() {
            return Err("OAuth token URL is required".to_string());
        }

        if !is_http_url(&self.token_url) {
            return Err("OAuth token URL must be a valid HTTP(S) URL".to_string());
        }

        // The refreshed identity comes from the user-info endpoint
        if self.userdata_url.is_empty() {
            return Err("OAuth userdata URL is required".to_string());
        }

        if !is_http_url(&self.userdata_url) {
            return Err("OAuth userdata URL must be a valid HTTP(S) URL".to_string());
        }

        if self.client_id.is_empty() {
            return Err("OAuth client id is required".to_string());
        }

        if self.username_key.is_empty() {
            return Err("OAuth username key must not be empty".to_string());
        }

        Ok(())
    }
}

pub(crate) fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProviderConfig::default();
        assert_eq!(config.username_key, "preferred_username");
        assert_eq!(config.userdata_method, UserdataMethod::Get);
        assert_eq!(config.userdata_token_method, UserdataTokenMethod::Header);
        assert!(config.tls_verify);
    }

    #[test]
    fn test_validation() {
        let mut config = ProviderConfig::default();
        assert!(config.validate().is_err()); // missing token URL

        config.token_url = "https://sso.example.com/token".to_string();
        assert!(config.validate().is_err()); // missing userdata URL

        config.userdata_url = "sso.example.com/userinfo".to_string();
        assert!(config.validate().is_err()); // not a URL

        config.userdata_url = "https://sso.example.com/userinfo".to_string();
        assert!(config.validate().is_err()); // missing client id

        config.client_id = "hub".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<UserdataMethod>(), Ok(UserdataMethod::Post));
        assert_eq!("URL".parse::<UserdataTokenMethod>(), Ok(UserdataTokenMethod::Url));
        assert!("PATCH".parse::<UserdataMethod>().is_err());
    }
}
