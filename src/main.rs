//! Hub Session Coordinator
//!
//! Runs the token refresh and idle-cull loops for a notebook hub's users
//! until interrupted. Sessions outlive the coordinator.
//!
//! This binary is the background half only. The hub embeds the library and
//! calls `SessionLifecycleCoordinator::login`, `spawn` and `record_activity`
//! from its own auth and spawn hooks.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hub_session_coordinator::access::AccessList;
use hub_session_coordinator::lifecycle::{
    spawn_cull_task, spawn_refresh_task, LifecycleConfig, SessionLifecycleCoordinator,
};
use hub_session_coordinator::oauth::{HttpTokenExchange, ProviderConfig, TokenRefresher};
use hub_session_coordinator::orchestrator::{HttpOrchestrator, OrchestratorConfig};
use hub_session_coordinator::secrets::fetcher::{ACCESS_KEY_FIELD, SECRET_KEY_FIELD};
use hub_session_coordinator::secrets::{SecretStoreConfig, VaultSecretFetcher};
use hub_session_coordinator::session::AuthStateStore;
use hub_session_coordinator::spawn::{LaunchConfig, NfsVolume, DEFAULT_ENV_KEEP};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "hub-session-coordinator")]
#[command(about = "Token refresh, pre-spawn secrets and idle culling for notebook hub sessions")]
struct Args {
    /// OAuth token endpoint
    #[arg(long, env = "OAUTH2_TOKEN_URL")]
    oauth2_token_url: Option<String>,

    /// OAuth user-info endpoint
    #[arg(long, env = "OAUTH2_USERDATA_URL")]
    oauth2_userdata_url: Option<String>,

    /// User-info HTTP method (GET or POST)
    #[arg(long, default_value = "GET", env = "OAUTH2_USERDATA_METHOD")]
    oauth2_userdata_method: String,

    /// How the access token is sent to the user-info endpoint (header or url)
    #[arg(long, default_value = "header", env = "OAUTH2_USERDATA_TOKEN_METHOD")]
    oauth2_userdata_token_method: String,

    /// User-info key holding the username
    #[arg(long, default_value = "preferred_username", env = "OAUTH2_USERNAME_KEY")]
    oauth2_username_key: String,

    #[arg(long, env = "OAUTH_CLIENT_ID")]
    oauth_client_id: Option<String>,

    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    oauth_client_secret: Option<String>,

    /// Verify the identity provider's TLS certificate
    #[arg(
        long,
        default_value = "true",
        env = "OAUTH_TLS_VERIFY",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    oauth_tls_verify: bool,

    /// Secret store URL; pre-spawn secrets are disabled when unset
    #[arg(long, env = "VAULT_URL")]
    vault_url: Option<String>,

    /// Secret store JWT auth role
    #[arg(long, env = "VAULT_ROLE")]
    vault_role: Option<String>,

    #[arg(long, default_value = "jwt", env = "VAULT_JWT_MOUNT")]
    vault_jwt_mount: String,

    #[arg(long, default_value = "valeria", env = "VAULT_KV_MOUNT")]
    vault_kv_mount: String,

    /// Idle seconds before a session is culled (0 disables culling)
    #[arg(long, default_value_t = 0, env = "JUPYTERHUB_IDLE_TIMEOUT")]
    idle_timeout: u64,

    #[arg(long, default_value_t = 600, env = "CULL_INTERVAL_SECS")]
    cull_interval_secs: u64,

    #[arg(long, default_value_t = 300, env = "REFRESH_INTERVAL_SECS")]
    refresh_interval_secs: u64,

    #[arg(long, default_value_t = 30, env = "PER_USER_TIMEOUT_SECS")]
    per_user_timeout_secs: u64,

    #[arg(long, default_value_t = 16, env = "MAX_CONCURRENT_USER_TASKS")]
    max_concurrent_user_tasks: usize,

    /// Refresh a stale access token before spawning
    #[arg(
        long,
        default_value = "true",
        env = "REFRESH_PRE_SPAWN",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    refresh_pre_spawn: bool,

    /// Object storage endpoint passed to sessions
    #[arg(long, env = "S3_ENDPOINT_URL")]
    s3_endpoint_url: Option<String>,

    #[arg(long, env = "NFS_SERVER")]
    nfs_server: Option<String>,

    #[arg(long, env = "NFS_PATH")]
    nfs_path: Option<String>,

    /// Orchestration API base URL
    #[arg(long, env = "ORCHESTRATOR_URL")]
    orchestrator_url: Option<String>,

    #[arg(long, env = "ORCHESTRATOR_TOKEN", hide_env_values = true)]
    orchestrator_token: Option<String>,

    /// Persist auth state in this redb file
    #[arg(long, env = "AUTH_STATE_PATH")]
    auth_state_path: Option<PathBuf>,

    #[arg(long, env = "ADMIN_USERS_FILE")]
    admin_users_file: Option<PathBuf>,

    #[arg(long, env = "USER_ALLOWLIST_FILE")]
    user_allowlist_file: Option<PathBuf>,

    #[arg(long, env = "IMAGE_LIST_FILE")]
    image_list_file: Option<PathBuf>,

    /// Hub variables copied into sessions (comma-separated)
    #[arg(long, env = "ENV_KEEP")]
    env_keep: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "COORDINATOR_VERBOSE")]
    verbose: bool,
}

/// Immutable process configuration, assembled once at startup.
#[derive(Debug, Clone)]
struct HubConfig {
    provider: ProviderConfig,
    secrets: SecretStoreConfig,
    launch: LaunchConfig,
    orchestrator: OrchestratorConfig,
    lifecycle: LifecycleConfig,
    access: AccessList,
    auth_state_path: Option<PathBuf>,
}

impl HubConfig {
    /// Build from arguments plus the captured `env_keep` values.
    fn from_args(args: &Args, kept_env: BTreeMap<String, String>) -> Result<Self> {
        let provider = ProviderConfig {
            token_url: args.oauth2_token_url.clone().unwrap_or_default(),
            userdata_url: args.oauth2_userdata_url.clone().unwrap_or_default(),
            userdata_method: args
                .oauth2_userdata_method
                .parse()
                .map_err(|e: String| anyhow!(e))?,
            userdata_token_method: args
                .oauth2_userdata_token_method
                .parse()
                .map_err(|e: String| anyhow!(e))?,
            username_key: args.oauth2_username_key.clone(),
            client_id: args.oauth_client_id.clone().unwrap_or_default(),
            client_secret: args.oauth_client_secret.clone().unwrap_or_default(),
            tls_verify: args.oauth_tls_verify,
            ..ProviderConfig::default()
        };
        provider
            .validate()
            .map_err(|e| anyhow!("Invalid OAuth provider config: {}", e))?;

        let secrets = SecretStoreConfig {
            enabled: args.vault_url.is_some(),
            url: args.vault_url.clone().unwrap_or_default(),
            role: args.vault_role.clone(),
            jwt_mount: args.vault_jwt_mount.clone(),
            kv_mount: args.vault_kv_mount.clone(),
            ..SecretStoreConfig::default()
        };
        secrets
            .validate()
            .map_err(|e| anyhow!("Invalid secret store config: {}", e))?;

        let access = AccessList::load(
            args.admin_users_file.as_deref(),
            args.user_allowlist_file.as_deref(),
            args.image_list_file.as_deref(),
        )?;

        let home_volume = match (&args.nfs_server, &args.nfs_path) {
            (Some(server), Some(path)) => Some(NfsVolume {
                server: server.clone(),
                path: path.clone(),
            }),
            (None, None) => None,
            _ => return Err(anyhow!("NFS_SERVER and NFS_PATH must be set together")),
        };

        let launch = LaunchConfig {
            storage_endpoint_url: args.s3_endpoint_url.clone(),
            allowed_images: access.images.clone(),
            kept_env,
            home_volume,
            ..LaunchConfig::default()
        };
        launch
            .validate()
            .map_err(|e| anyhow!("Invalid launch config: {}", e))?;

        let orchestrator = OrchestratorConfig {
            url: args.orchestrator_url.clone().unwrap_or_default(),
            api_token: args.orchestrator_token.clone(),
            ..OrchestratorConfig::default()
        };
        orchestrator
            .validate()
            .map_err(|e| anyhow!("Invalid orchestrator config: {}", e))?;

        let lifecycle = LifecycleConfig {
            refresh_interval_secs: args.refresh_interval_secs,
            cull_interval_secs: args.cull_interval_secs,
            idle_timeout_secs: args.idle_timeout,
            per_user_timeout_secs: args.per_user_timeout_secs,
            max_concurrent_user_tasks: args.max_concurrent_user_tasks,
            refresh_pre_spawn: args.refresh_pre_spawn,
        };
        lifecycle
            .validate()
            .map_err(|e| anyhow!("Invalid lifecycle config: {}", e))?;

        Ok(Self {
            provider,
            secrets,
            launch,
            orchestrator,
            lifecycle,
            access,
            auth_state_path: args.auth_state_path.clone(),
        })
    }
}

/// Names of hub variables to pass through.
///
/// Per-user credential names are dropped; those only come from the secret store.
fn env_keep_names(list: Option<&str>) -> Vec<String> {
    let names: Vec<String> = match list {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        None => DEFAULT_ENV_KEEP.iter().map(|s| s.to_string()).collect(),
    };

    names
        .into_iter()
        .filter(|name| {
            let secret = name == ACCESS_KEY_FIELD || name == SECRET_KEY_FIELD;
            if secret {
                warn!(name = %name, "Ignoring credential variable in ENV_KEEP");
            }
            !secret
        })
        .collect()
}

/// Capture values of the kept variables that are set at startup.
fn capture_env(names: &[String]) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={}",
            env!("CARGO_CRATE_NAME"),
            log_level
        ))
        .json()
        .init();

    info!("Starting hub session coordinator");

    let kept_env = capture_env(&env_keep_names(args.env_keep.as_deref()));
    let config = HubConfig::from_args(&args, kept_env)?;

    info!(
        secret_store = config.secrets.enabled,
        culling = config.lifecycle.culling_enabled(),
        idle_timeout_secs = config.lifecycle.idle_timeout_secs,
        kept_env = config.launch.kept_env.len(),
        home_volume = config.launch.home_volume.is_some(),
        admins = config.access.admins.len(),
        "Configuration loaded"
    );

    let exchange = HttpTokenExchange::new(config.provider.clone())?;
    let refresher = TokenRefresher::new(Arc::new(exchange), config.provider.username_key.clone());
    let orchestrator = HttpOrchestrator::new(&config.orchestrator)?;

    let mut coordinator = SessionLifecycleCoordinator::new(
        refresher,
        Arc::new(orchestrator),
        config.launch.clone(),
        config.lifecycle.clone(),
    )
    .with_access(config.access.clone());

    if config.secrets.enabled {
        let fetcher = VaultSecretFetcher::new(config.secrets.clone())?;
        coordinator = coordinator.with_secrets(Arc::new(fetcher));
    }

    if let Some(path) = &config.auth_state_path {
        let store = AuthStateStore::open(path.clone())?;
        info!(path = ?path, "Auth state store initialized");
        coordinator = coordinator.with_store(Arc::new(store));
    }

    let coordinator = Arc::new(coordinator);

    // Recover from the platform, not from memory
    let now = Utc::now();
    coordinator
        .restore_from_store(now)
        .context("Failed to restore auth state")?;
    if let Err(e) = coordinator.reconcile(now).await {
        warn!(error = %format!("{e:#}"), "Initial reconciliation failed, retrying on next sweep");
    }

    let shutdown = CancellationToken::new();
    let refresh_handle = spawn_refresh_task(Arc::clone(&coordinator), shutdown.clone());
    let cull_handle = spawn_cull_task(Arc::clone(&coordinator), shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down, running sessions are left in place");
    shutdown.cancel();
    let (refresh, cull) = tokio::join!(refresh_handle, cull_handle);
    refresh.context("Refresh task panicked")?;
    cull.context("Cull task panicked")?;

    Ok(())
}
