//! OAuth 2.0 token handling for hub users.
//!
//! Tokens are kept as immutable [`TokenState`] snapshots. The
//! [`TokenRefresher`] decides when a snapshot needs refreshing and performs
//! the refresh_token grant against the provider, one exchange per user at a
//! time.

pub mod client;
pub mod config;
pub mod refresher;
pub mod token;

pub use client::HttpTokenExchange;
pub use config::{ProviderConfig, UserdataMethod, UserdataTokenMethod};
pub use refresher::{RefreshedAuth, TokenExchange, TokenRefresher};
pub use token::{TokenResponse, TokenState, TokenStatus};
