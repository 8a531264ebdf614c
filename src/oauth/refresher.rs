//! Token refresh decisions and the refresh exchange.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::token::{TokenResponse, TokenState, TokenStatus};
use crate::error::AuthError;

/// Network side of a refresh: the token endpoint and the user-info endpoint.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Redeem a refresh token (grant_type=refresh_token).
    ///
    /// Besides `TransportFailure` and `MalformedResponse`, a provider that
    /// refuses the refresh token itself (400 `invalid_grant`, 401) yields
    /// `IdentityRejected`, so callers can tell a revoked grant from an outage.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;

    /// Fetch the user-info document for a freshly issued access token.
    async fn fetch_user_info(
        &self,
        token_type: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, AuthError>;
}

/// A successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedAuth {
    pub token: TokenState,
    /// Username reported by the user-info endpoint.
    pub username: String,
    pub oauth_user: serde_json::Value,
}

/// Decides when tokens need refreshing and performs the refresh.
///
/// Refreshes for one user run one at a time: providers invalidate the old
/// refresh token on use, so two racing exchanges would void each other.
pub struct TokenRefresher {
    exchange: Arc<dyn TokenExchange>,
    username_key: String,
    /// Per-user refresh locks.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(exchange: Arc<dyn TokenExchange>, username_key: impl Into<String>) -> Self {
        Self {
            exchange,
            username_key: username_key.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Classify a token at `now`.
    pub fn evaluate(&self, state: &TokenState, now: DateTime<Utc>) -> TokenStatus {
        state.evaluate(now)
    }

    /// Lock held while refreshing `user_id`. Callers that re-read stored
    /// state before refreshing take it around the read as well.
    pub fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a user that logged out.
    pub fn forget_user(&self, user_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(user_id);
    }

    /// Refresh `state` for `user_id`, serialized per user.
    pub async fn refresh(
        &self,
        user_id: &str,
        state: &TokenState,
        now: DateTime<Utc>,
    ) -> Result<RefreshedAuth, AuthError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.refresh_locked(user_id, state, now).await
    }

    /// Refresh while the caller already holds the user's lock.
    pub async fn refresh_locked(
        &self,
        user_id: &str,
        state: &TokenState,
        now: DateTime<Utc>,
    ) -> Result<RefreshedAuth, AuthError> {
        debug!(user = %user_id, "Refreshing access token");

        let response = self
            .exchange
            .exchange_refresh_token(state.refresh_token())
            .await?;

        let token = TokenState::from_response(&response, Some(state), now)?;
        if token.evaluate(now) != TokenStatus::Valid {
            return Err(AuthError::malformed(
                "provider issued an access token that is already expired",
            ));
        }

        let oauth_user = self
            .exchange
            .fetch_user_info(token.token_type(), token.access_token())
            .await?;

        let username = match oauth_user.get(&self.username_key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                warn!(
                    user = %user_id,
                    username_key = %self.username_key,
                    "OAuth user info contains no username key, keeping previous tokens"
                );
                return Err(AuthError::malformed(format!(
                    "user info has no '{}' key",
                    self.username_key
                )));
            }
        };

        info!(
            user = %user_id,
            access_expiry = %token.access_expiry(),
            "Access token refreshed"
        );

        Ok(RefreshedAuth {
            token,
            username,
            oauth_user,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AuthErrorKind;
    use crate::oauth::token::tests::{jwt_expiring_at, token_state};
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake provider counting calls and tracking concurrent exchanges.
    pub(crate) struct FakeExchange {
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub delay: std::time::Duration,
        pub user_info: serde_json::Value,
        pub fail_with: Option<AuthError>,
    }

    impl FakeExchange {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: std::time::Duration::from_millis(0),
                user_info: json!({ "preferred_username": "alice" }),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn exchange_refresh_token(&self, _refresh_token: &str) -> Result<TokenResponse, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }

            let now = Utc::now();
            Ok(TokenResponse {
                access_token: jwt_expiring_at(now + Duration::seconds(300)),
                refresh_token: Some(jwt_expiring_at(now + Duration::seconds(1800))),
                token_type: "Bearer".to_string(),
                scope: Some(json!("openid")),
                expires_in: None,
                refresh_expires_in: None,
            })
        }

        async fn fetch_user_info(
            &self,
            _token_type: &str,
            _access_token: &str,
        ) -> Result<serde_json::Value, AuthError> {
            Ok(self.user_info.clone())
        }
    }

    fn expired_access() -> TokenState {
        let now = Utc::now();
        token_state(now - Duration::seconds(60), now + Duration::seconds(3600))
    }

    #[tokio::test]
    async fn test_refresh_yields_valid_token() {
        let exchange = Arc::new(FakeExchange::new());
        let refresher = TokenRefresher::new(exchange.clone(), "preferred_username");
        let state = expired_access();
        let now = Utc::now();

        assert_eq!(refresher.evaluate(&state, now), TokenStatus::NeedsRefresh);

        let refreshed = refresher.refresh("alice", &state, now).await.unwrap();
        assert_eq!(refreshed.username, "alice");
        assert!(refreshed.token.access_expiry() > now);
        assert_eq!(refreshed.token.evaluate(now), TokenStatus::Valid);
        // Input snapshot is unchanged
        assert_eq!(state.access_token(), "access");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_missing_username_key() {
        let mut exchange = FakeExchange::new();
        exchange.user_info = json!({ "email": "alice@example.com" });
        let refresher = TokenRefresher::new(Arc::new(exchange), "preferred_username");

        let err = refresher
            .refresh("alice", &expired_access(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::MalformedResponse);
        assert!(err.detail.contains("preferred_username"));
    }

    #[tokio::test]
    async fn test_refresh_transport_failure() {
        let mut exchange = FakeExchange::new();
        exchange.fail_with = Some(AuthError::transport("connection refused"));
        let refresher = TokenRefresher::new(Arc::new(exchange), "preferred_username");

        let err = refresher
            .refresh("alice", &expired_access(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::TransportFailure);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_same_user_is_serialized() {
        let mut exchange = FakeExchange::new();
        exchange.delay = std::time::Duration::from_millis(20);
        let exchange = Arc::new(exchange);
        let refresher = Arc::new(TokenRefresher::new(exchange.clone(), "preferred_username"));
        let state = expired_access();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let refresher = Arc::clone(&refresher);
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                refresher.refresh("alice", &state, Utc::now()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 5);
        assert_eq!(exchange.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_different_users_overlap() {
        let mut exchange = FakeExchange::new();
        exchange.delay = std::time::Duration::from_millis(50);
        let exchange = Arc::new(exchange);
        let refresher = Arc::new(TokenRefresher::new(exchange.clone(), "preferred_username"));
        let state = expired_access();

        let a = {
            let refresher = Arc::clone(&refresher);
            let state = state.clone();
            tokio::spawn(async move { refresher.refresh("alice", &state, Utc::now()).await })
        };
        let b = {
            let refresher = Arc::clone(&refresher);
            let state = state.clone();
            tokio::spawn(async move { refresher.refresh("bob", &state, Utc::now()).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(exchange.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
