//! Per-user secrets fetched before a session starts.

pub mod config;
pub mod fetcher;

pub use config::SecretStoreConfig;
pub use fetcher::{SecretBundle, SecretFetcher, VaultSecretFetcher};
