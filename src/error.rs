//! Error taxonomy for the coordinator.
//!
//! Auth and validation errors are typed so callers can pick a degradation
//! policy per kind; plumbing errors (stores, config files, platform I/O)
//! travel as `anyhow::Error`.

use std::fmt;

/// Kind of authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// The request never produced a usable HTTP response.
    TransportFailure,
    /// The response arrived but could not be interpreted.
    MalformedResponse,
    /// The identity token was refused outright.
    IdentityRejected,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthErrorKind::TransportFailure => write!(f, "transport_failure"),
            AuthErrorKind::MalformedResponse => write!(f, "malformed_response"),
            AuthErrorKind::IdentityRejected => write!(f, "identity_rejected"),
        }
    }
}

/// Failure talking to the identity provider or the secret store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub detail: String,
}

impl AuthError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: AuthErrorKind::TransportFailure,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: AuthErrorKind::MalformedResponse,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            kind: AuthErrorKind::IdentityRejected,
            detail: detail.into(),
        }
    }
}

/// Kind of spawn form rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Field missing or not parseable as the required type.
    MalformedField,
    /// Image is not in the configured image list.
    DisallowedImage,
}

/// Spawn form rejection. Fatal to the spawn attempt only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid spawn field '{field}' ({kind:?})")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub field: String,
}

impl ValidationError {
    pub fn malformed(field: &str) -> Self {
        Self {
            kind: ValidationErrorKind::MalformedField,
            field: field.to_string(),
        }
    }

    pub fn disallowed_image(field: &str) -> Self {
        Self {
            kind: ValidationErrorKind::DisallowedImage,
            field: field.to_string(),
        }
    }
}

/// A single secret slot that could not be resolved. Never fatal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("secret '{slot}' unavailable: {reason}")]
pub struct SecretUnavailable {
    pub slot: &'static str,
    pub reason: String,
}

/// Errors surfaced by the lifecycle coordinator to its callers.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("user {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("user {0} is not allowed to use this hub")]
    NotAllowed(String),

    #[error("user {0} already has a session starting or running")]
    AlreadyActive(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("orchestration platform error: {0}")]
    Platform(String),

    #[error("state error: {0}")]
    State(String),
}
