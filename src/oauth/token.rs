//! OAuth token snapshots.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::AuthError;

/// Token endpoint response body.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Space-separated string or array of scopes.
    #[serde(default)]
    pub scope: Option<serde_json::Value>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Keycloak reports the refresh token lifetime separately.
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Outcome of evaluating a token against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Access token still good.
    Valid,
    /// Access token expired, refresh token still good.
    NeedsRefresh,
    /// Refresh token expired. Full re-authentication required.
    Expired,
}

/// Immutable snapshot of a user's tokens.
///
/// Expiries are derived once when the snapshot is built. A refresh produces a
/// new `TokenState`; an existing one is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    access_token: String,
    refresh_token: String,
    token_type: String,
    access_expiry: DateTime<Utc>,
    refresh_expiry: DateTime<Utc>,
    scopes: BTreeSet<String>,
}

/// Only the expiry is read from our own tokens.
#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

impl TokenState {
    pub fn new(
        access_token: String,
        refresh_token: String,
        token_type: String,
        access_expiry: DateTime<Utc>,
        refresh_expiry: DateTime<Utc>,
        scopes: BTreeSet<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type,
            access_expiry,
            refresh_expiry,
            scopes,
        }
    }

    /// Build a snapshot from a token endpoint response received at `now`.
    ///
    /// `previous` supplies the refresh token when the provider does not rotate it.
    pub fn from_response(
        response: &TokenResponse,
        previous: Option<&TokenState>,
        now: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        if response.access_token.is_empty() {
            return Err(AuthError::malformed("token response has an empty access_token"));
        }

        let access_expiry = expiry_of(&response.access_token, response.expires_in, now)
            .ok_or_else(|| AuthError::malformed("cannot determine access token expiry"))?;

        let (refresh_token, refresh_expiry) = match (&response.refresh_token, previous) {
            (Some(token), _) if !token.is_empty() => {
                let expiry = expiry_of(token, response.refresh_expires_in, now)
                    .ok_or_else(|| AuthError::malformed("cannot determine refresh token expiry"))?;
                (token.clone(), expiry)
            }
            (_, Some(prev)) => (prev.refresh_token.clone(), prev.refresh_expiry),
            _ => return Err(AuthError::malformed("token response has no refresh_token")),
        };

        Ok(Self {
            access_token: response.access_token.clone(),
            refresh_token,
            token_type: response.token_type.clone(),
            access_expiry,
            refresh_expiry,
            scopes: parse_scopes(response.scope.as_ref()),
        })
    }

    /// Classify this snapshot at `now`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.access_expiry > now {
            TokenStatus::Valid
        } else if self.refresh_expiry <= now {
            TokenStatus::Expired
        } else {
            TokenStatus::NeedsRefresh
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn access_expiry(&self) -> DateTime<Utc> {
        self.access_expiry
    }

    pub fn refresh_expiry(&self) -> DateTime<Utc> {
        self.refresh_expiry
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }
}

/// Expiry from the token's `exp` claim, else from a relative lifetime.
fn expiry_of(token: &str, expires_in: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    unverified_exp(token)
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
        .or_else(|| expires_in.map(|secs| now + Duration::seconds(secs)))
}

/// Read `exp` without checking the signature. Non-JWT tokens yield `None`.
fn unverified_exp(token: &str) -> Option<i64> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| data.claims.exp)
}

fn parse_scopes(scope: Option<&serde_json::Value>) -> BTreeSet<String> {
    match scope {
        Some(serde_json::Value::String(s)) => s.split_whitespace().map(String::from).collect(),
        Some(serde_json::Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => BTreeSet::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    /// HS256 token carrying only an `exp` claim.
    pub(crate) fn jwt_expiring_at(exp: DateTime<Utc>) -> String {
        encode(
            &Header::default(),
            &json!({ "exp": exp.timestamp(), "sub": "alice" }),
            &EncodingKey::from_secret(b"provider-signing-key"),
        )
        .unwrap()
    }

    pub(crate) fn token_state(access_expiry: DateTime<Utc>, refresh_expiry: DateTime<Utc>) -> TokenState {
        TokenState::new(
            "access".to_string(),
            "refresh".to_string(),
            "Bearer".to_string(),
            access_expiry,
            refresh_expiry,
            BTreeSet::new(),
        )
    }

    fn response(access: String, refresh: Option<String>) -> TokenResponse {
        TokenResponse {
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".to_string(),
            scope: Some(json!("openid profile")),
            expires_in: None,
            refresh_expires_in: None,
        }
    }

    #[test]
    fn test_evaluate_valid() {
        let now = Utc::now();
        // Valid wins even when the refresh token is already gone
        for (access, refresh) in [(60, 3600), (1, -10), (3600, 3600)] {
            let state = token_state(now + Duration::seconds(access), now + Duration::seconds(refresh));
            assert_eq!(state.evaluate(now), TokenStatus::Valid);
        }
    }

    #[test]
    fn test_evaluate_needs_refresh() {
        let now = Utc::now();
        let state = token_state(now, now + Duration::seconds(1));
        assert_eq!(state.evaluate(now), TokenStatus::NeedsRefresh);

        let state = token_state(now - Duration::seconds(300), now + Duration::seconds(3600));
        assert_eq!(state.evaluate(now), TokenStatus::NeedsRefresh);
    }

    #[test]
    fn test_evaluate_expired() {
        let now = Utc::now();
        let state = token_state(now - Duration::seconds(10), now);
        assert_eq!(state.evaluate(now), TokenStatus::Expired);

        let state = token_state(now - Duration::seconds(10), now - Duration::seconds(5));
        assert_eq!(state.evaluate(now), TokenStatus::Expired);
    }

    #[test]
    fn test_from_response_reads_jwt_expiry() {
        let now = Utc::now();
        let access_exp = now + Duration::seconds(300);
        let refresh_exp = now + Duration::seconds(1800);
        let resp = response(jwt_expiring_at(access_exp), Some(jwt_expiring_at(refresh_exp)));

        let state = TokenState::from_response(&resp, None, now).unwrap();
        assert_eq!(state.access_expiry().timestamp(), access_exp.timestamp());
        assert_eq!(state.refresh_expiry().timestamp(), refresh_exp.timestamp());
        assert!(state.scopes().contains("openid"));
        assert!(state.scopes().contains("profile"));
    }

    #[test]
    fn test_from_response_falls_back_to_expires_in() {
        let now = Utc::now();
        let mut resp = response("opaque-access".to_string(), Some("opaque-refresh".to_string()));
        resp.expires_in = Some(300);
        resp.refresh_expires_in = Some(1800);
        resp.scope = Some(json!(["read", "write"]));

        let state = TokenState::from_response(&resp, None, now).unwrap();
        assert_eq!(state.access_expiry(), now + Duration::seconds(300));
        assert_eq!(state.refresh_expiry(), now + Duration::seconds(1800));
        assert_eq!(state.scopes().len(), 2);
    }

    #[test]
    fn test_from_response_keeps_previous_refresh_token() {
        let now = Utc::now();
        let previous = token_state(now - Duration::seconds(10), now + Duration::seconds(600));
        let resp = response(jwt_expiring_at(now + Duration::seconds(300)), None);

        let state = TokenState::from_response(&resp, Some(&previous), now).unwrap();
        assert_eq!(state.refresh_token(), "refresh");
        assert_eq!(state.refresh_expiry(), previous.refresh_expiry());
        // Previous snapshot is untouched
        assert_eq!(previous.access_token(), "access");
    }

    #[test]
    fn test_from_response_without_expiry_is_malformed() {
        let now = Utc::now();
        let resp = response("opaque-access".to_string(), Some("opaque-refresh".to_string()));
        let err = TokenState::from_response(&resp, None, now).unwrap_err();
        assert_eq!(err.kind, crate::error::AuthErrorKind::MalformedResponse);
    }

    #[test]
    fn test_token_response_deserialization() {
        let resp: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "token_type": "bearer",
            "expires_in": 300
        }))
        .unwrap();
        assert_eq!(resp.token_type, "bearer");
        assert!(resp.refresh_token.is_none());
        assert!(resp.scope.is_none());
    }
}
