//! Pre-spawn secret retrieval.
//!
//! The identity token is exchanged for a store token, then each secret slot
//! is read on its own. A slot that cannot be read is logged and left empty;
//! only a refused identity fails the fetch as a whole.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::SecretStoreConfig;
use crate::error::{AuthError, SecretUnavailable};

pub const ACCESS_KEY_FIELD: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_FIELD: &str = "AWS_SECRET_ACCESS_KEY";
pub const UID_FIELD: &str = "uid";

/// Secrets resolved for one spawn attempt. Every slot is independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretBundle {
    pub storage_access_key: Option<String>,
    pub storage_secret_key: Option<String>,
    pub uid: Option<u32>,
}

/// Exchanges an identity token for a user's secrets.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    /// Fetch every slot for `user_key`.
    ///
    /// Errors only when the store cannot be authenticated against at all;
    /// missing slots come back as `None`.
    async fn fetch(&self, identity_token: &str, user_key: &str) -> Result<SecretBundle, AuthError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    entity_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvData,
}

#[derive(Debug, Deserialize)]
struct KvData {
    data: HashMap<String, serde_json::Value>,
}

/// Vault-compatible [`SecretFetcher`] (JWT auth + KV v2).
pub struct VaultSecretFetcher {
    config: SecretStoreConfig,
    http_client: reqwest::Client,
}

impl VaultSecretFetcher {
    pub fn new(config: SecretStoreConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Log in with the identity token. Returns the store token and entity id.
    async fn login(&self, identity_token: &str) -> Result<LoginAuth, AuthError> {
        let url = format!(
            "{}/v1/auth/{}/login",
            self.config.base_url(),
            self.config.jwt_mount
        );
        let body = serde_json::json!({
            "role": self.config.role,
            "jwt": identity_token,
        });

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::transport(format!("secret store login: {}", e)))?;

        match response.status() {
            status if status.is_success() => response
                .json::<LoginResponse>()
                .await
                .map(|r| r.auth)
                .map_err(|e| AuthError::malformed(format!("secret store login: {}", e))),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AuthError::rejected(format!(
                    "secret store refused identity token ({})",
                    response.status()
                )))
            }
            status => Err(AuthError::transport(format!(
                "secret store login returned status {}",
                status
            ))),
        }
    }

    /// Read one KV v2 secret.
    async fn read(
        &self,
        store_token: &str,
        path: &str,
        slot: &'static str,
    ) -> Result<HashMap<String, serde_json::Value>, SecretUnavailable> {
        let url = format!(
            "{}/v1/{}/data/{}",
            self.config.base_url(),
            self.config.kv_mount,
            path
        );

        let unavailable = |reason: String| SecretUnavailable { slot, reason };

        let response = self
            .http_client
            .get(&url)
            .header("X-Vault-Token", store_token)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }

        response
            .json::<KvReadResponse>()
            .await
            .map(|r| r.data.data)
            .map_err(|e| unavailable(e.to_string()))
    }

    async fn read_credentials(
        &self,
        store_token: &str,
        id: &str,
    ) -> (Result<String, SecretUnavailable>, Result<String, SecretUnavailable>) {
        match self
            .read(store_token, &format!("users/{}/credentials", id), "credentials")
            .await
        {
            Ok(data) => (
                string_field(&data, ACCESS_KEY_FIELD),
                string_field(&data, SECRET_KEY_FIELD),
            ),
            Err(e) => (Err(e.clone()), Err(e)),
        }
    }

    async fn read_uid(&self, store_token: &str, id: &str) -> Result<u32, SecretUnavailable> {
        let data = self
            .read(store_token, &format!("users/{}/uid", id), UID_FIELD)
            .await?;

        let parsed = match data.get(UID_FIELD) {
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Some(serde_json::Value::String(s)) => s.trim().parse::<u32>().ok(),
            _ => None,
        };

        parsed.ok_or_else(|| SecretUnavailable {
            slot: UID_FIELD,
            reason: "missing or not a valid uid".to_string(),
        })
    }
}

fn string_field(
    data: &HashMap<String, serde_json::Value>,
    field: &'static str,
) -> Result<String, SecretUnavailable> {
    match data.get(field) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(SecretUnavailable {
            slot: field,
            reason: "missing from secret".to_string(),
        }),
    }
}

/// Log an unavailable slot and turn it into an absent value.
fn soft<T>(user_key: &str, result: Result<T, SecretUnavailable>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(user = %user_key, slot = e.slot, reason = %e.reason, "Secret unavailable");
            None
        }
    }
}

#[async_trait]
impl SecretFetcher for VaultSecretFetcher {
    async fn fetch(&self, identity_token: &str, user_key: &str) -> Result<SecretBundle, AuthError> {
        let auth = self.login(identity_token).await?;
        let id = auth.entity_id.as_deref().unwrap_or(user_key);

        debug!(user = %user_key, entity_id = %id, "Logged in to secret store");

        let ((access_key, secret_key), uid) = tokio::join!(
            self.read_credentials(&auth.client_token, id),
            self.read_uid(&auth.client_token, id),
        );

        let bundle = SecretBundle {
            storage_access_key: soft(user_key, access_key),
            storage_secret_key: soft(user_key, secret_key),
            uid: soft(user_key, uid),
        };

        info!(
            user = %user_key,
            has_access_key = bundle.storage_access_key.is_some(),
            has_secret_key = bundle.storage_secret_key.is_some(),
            has_uid = bundle.uid.is_some(),
            "Secrets fetched"
        );

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(server: &MockServer) -> VaultSecretFetcher {
        VaultSecretFetcher::new(SecretStoreConfig {
            enabled: true,
            url: server.uri(),
            ..SecretStoreConfig::default()
        })
        .unwrap()
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/jwt/login"))
            .and(body_partial_json(json!({ "jwt": "id-token" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": { "client_token": "store-token", "entity_id": "ent-42" }
            })))
            .mount(server)
            .await;
    }

    fn kv(data: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "data": data, "metadata": {} } }))
    }

    #[tokio::test]
    async fn test_fetch_all_slots() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/credentials"))
            .and(header("X-Vault-Token", "store-token"))
            .respond_with(kv(json!({
                "AWS_ACCESS_KEY_ID": "AKIA123",
                "AWS_SECRET_ACCESS_KEY": "s3cr3t"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/uid"))
            .respond_with(kv(json!({ "uid": "1001" })))
            .mount(&server)
            .await;

        let bundle = fetcher(&server).fetch("id-token", "alice").await.unwrap();
        assert_eq!(bundle.storage_access_key.as_deref(), Some("AKIA123"));
        assert_eq!(bundle.storage_secret_key.as_deref(), Some("s3cr3t"));
        assert_eq!(bundle.uid, Some(1001));
    }

    #[tokio::test]
    async fn test_fetch_partial_failure() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/credentials"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/uid"))
            .respond_with(kv(json!({ "uid": 2002 })))
            .mount(&server)
            .await;

        let bundle = fetcher(&server).fetch("id-token", "alice").await.unwrap();
        assert_eq!(bundle.storage_access_key, None);
        assert_eq!(bundle.storage_secret_key, None);
        assert_eq!(bundle.uid, Some(2002));
    }

    #[tokio::test]
    async fn test_fetch_one_credential_field_missing() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/credentials"))
            .respond_with(kv(json!({ "AWS_ACCESS_KEY_ID": "AKIA123" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/ent-42/uid"))
            .respond_with(kv(json!({ "uid": "not-a-number" })))
            .mount(&server)
            .await;

        let bundle = fetcher(&server).fetch("id-token", "alice").await.unwrap();
        assert_eq!(bundle.storage_access_key.as_deref(), Some("AKIA123"));
        assert_eq!(bundle.storage_secret_key, None);
        assert_eq!(bundle.uid, None);
    }

    #[tokio::test]
    async fn test_fetch_identity_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/jwt/login"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(&server).fetch("bad-token", "alice").await.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::IdentityRejected);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_fetch_uses_user_key_without_entity_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/jwt/login"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "auth": { "client_token": "t" } })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/valeria/data/users/alice/uid"))
            .respond_with(kv(json!({ "uid": 3003 })))
            .mount(&server)
            .await;

        let bundle = fetcher(&server).fetch("id-token", "alice").await.unwrap();
        assert_eq!(bundle.uid, Some(3003));
        assert!(bundle.storage_access_key.is_none());
    }
}
