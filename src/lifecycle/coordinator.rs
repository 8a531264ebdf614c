//! Per-user session lifecycle.
//!
//! A user moves `NoAuth -> Authenticated -> PreSpawnPending -> Spawning ->
//! Running`, and a running session goes `Idle` then `Culled` once the sweep
//! sees no activity. Token refresh runs on its own schedule and never touches
//! running sessions.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::LifecycleConfig;
use crate::access::AccessList;
use crate::error::CoordinatorError;
use crate::oauth::{RefreshedAuth, TokenRefresher, TokenState, TokenStatus};
use crate::orchestrator::Orchestrator;
use crate::secrets::{SecretBundle, SecretFetcher};
use crate::session::{
    AuthStateStore, ReconcileReport, SessionHandle, SessionRecord, SessionRegistry, SessionState,
    StoredAuthState,
};
use crate::spawn::{plan, FormInput, LaunchConfig};

/// Where a user currently is in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPhase {
    NoAuth,
    Authenticated,
    PreSpawnPending,
    Spawning,
    Running,
    Idle,
    Culled,
}

/// Counts from one periodic refresh pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub unchanged: usize,
    pub refreshed: usize,
    /// Users dropped to NoAuth.
    pub expired: usize,
    /// Refreshes that failed or timed out. Stale tokens are kept.
    pub failed: usize,
}

/// Counts from one cull sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CullReport {
    /// Termination requests issued.
    pub requested: usize,
    pub terminated: usize,
    pub failed: usize,
}

enum RefreshOutcome {
    Unchanged,
    Refreshed,
    Expired,
    Failed,
}

#[derive(Debug, Clone)]
struct UserAuth {
    token: TokenState,
    username: String,
}

/// Coordinates auth, spawning, refresh and culling for every hub user.
pub struct SessionLifecycleCoordinator {
    refresher: TokenRefresher,
    secrets: Option<Arc<dyn SecretFetcher>>,
    orchestrator: Arc<dyn Orchestrator>,
    registry: SessionRegistry,
    store: Option<Arc<AuthStateStore>>,
    access: AccessList,
    launch: LaunchConfig,
    config: LifecycleConfig,
    auth: RwLock<HashMap<String, UserAuth>>,
    /// Spawns in progress, keyed by user.
    pending: Mutex<HashMap<String, UserPhase>>,
    refresh_permits: Arc<Semaphore>,
    cull_permits: Arc<Semaphore>,
}

/// Marks a spawn in progress; cleared when dropped, whatever the outcome.
struct PendingSpawn<'a> {
    pending: &'a Mutex<HashMap<String, UserPhase>>,
    user_id: String,
}

impl PendingSpawn<'_> {
    fn advance(&self, phase: UserPhase) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(self.user_id.clone(), phase);
        }
    }
}

impl Drop for PendingSpawn<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.user_id);
        }
    }
}

fn state_error(e: anyhow::Error) -> CoordinatorError {
    CoordinatorError::State(format!("{e:#}"))
}

impl SessionLifecycleCoordinator {
    pub fn new(
        refresher: TokenRefresher,
        orchestrator: Arc<dyn Orchestrator>,
        launch: LaunchConfig,
        config: LifecycleConfig,
    ) -> Self {
        let permits = config.max_concurrent_user_tasks;
        Self {
            refresher,
            secrets: None,
            orchestrator,
            registry: SessionRegistry::new(),
            store: None,
            access: AccessList::default(),
            launch,
            config,
            auth: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            refresh_permits: Arc::new(Semaphore::new(permits)),
            cull_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretFetcher>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_store(mut self, store: Arc<AuthStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_access(mut self, access: AccessList) -> Self {
        self.access = access;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Current phase of `user_id`. A running session wins over auth state.
    pub fn phase(&self, user_id: &str) -> Result<UserPhase, CoordinatorError> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| CoordinatorError::State("Lock poisoned".to_string()))?
            .get(user_id)
            .copied();
        if let Some(phase) = pending {
            return Ok(phase);
        }

        if let Some(record) = self.registry.get(user_id).map_err(state_error)? {
            return Ok(match record.state {
                SessionState::Active => UserPhase::Running,
                SessionState::Idle => UserPhase::Idle,
                SessionState::Culled => UserPhase::Culled,
            });
        }

        Ok(match self.auth_of(user_id)? {
            Some(_) => UserPhase::Authenticated,
            None => UserPhase::NoAuth,
        })
    }

    /// Accept a freshly issued token for `user_id`.
    pub fn login(
        &self,
        user_id: &str,
        token: TokenState,
        username: String,
    ) -> Result<(), CoordinatorError> {
        if !self.access.is_allowed(user_id) {
            warn!(user = %user_id, "Login refused, user not in allowlist");
            return Err(CoordinatorError::NotAllowed(user_id.to_string()));
        }

        if token.evaluate(Utc::now()) == TokenStatus::Expired {
            return Err(CoordinatorError::NotAuthenticated(user_id.to_string()));
        }

        let auth = UserAuth { token, username };
        if let Some(store) = &self.store {
            store
                .save(&stored(user_id, &auth, Utc::now()))
                .map_err(state_error)?;
        }
        self.auth
            .write()
            .map_err(|_| CoordinatorError::State("Lock poisoned".to_string()))?
            .insert(user_id.to_string(), auth);

        info!(
            user = %user_id,
            admin = self.access.is_admin(user_id),
            "User authenticated"
        );
        Ok(())
    }

    /// Drop a user's auth state. Running sessions are unaffected.
    pub fn logout(&self, user_id: &str) -> Result<bool, CoordinatorError> {
        let removed = self
            .auth
            .write()
            .map_err(|_| CoordinatorError::State("Lock poisoned".to_string()))?
            .remove(user_id)
            .is_some();
        if let Some(store) = &self.store {
            store.delete(user_id).map_err(state_error)?;
        }
        self.refresher.forget_user(user_id);

        if removed {
            info!(user = %user_id, "User logged out");
        }
        Ok(removed)
    }

    /// Start a session for `user_id` from a submitted spawn form.
    ///
    /// Secret-store problems degrade to a session without secrets. An
    /// invalid form aborts before the platform is contacted.
    pub async fn spawn(
        &self,
        user_id: &str,
        form: &FormInput,
    ) -> Result<SessionHandle, CoordinatorError> {
        if self.auth_of(user_id)?.is_none() {
            return Err(CoordinatorError::NotAuthenticated(user_id.to_string()));
        }

        let pending = self.begin_spawn(user_id)?;
        let auth = self.prepare_auth(user_id).await?;
        let secrets = self.fetch_secrets(user_id, &auth).await;

        let spec = plan(&auth.username, form, &secrets, &self.launch).inspect_err(|e| {
            info!(user = %user_id, error = %e, "Spawn form rejected");
        })?;

        pending.advance(UserPhase::Spawning);
        let handle = match timeout(
            self.config.per_user_timeout(),
            self.orchestrator.create_session(user_id, &spec),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(CoordinatorError::Platform(format!("{e:#}"))),
            Err(_) => {
                return Err(CoordinatorError::Platform(
                    "session creation timed out".to_string(),
                ))
            }
        };

        self.registry
            .insert(SessionRecord::new(
                user_id.to_string(),
                handle.clone(),
                Utc::now(),
            ))
            .map_err(state_error)?;

        info!(
            user = %user_id,
            handle = %handle,
            image = %spec.image,
            with_credentials = spec.environment.contains_key(crate::secrets::fetcher::ACCESS_KEY_FIELD),
            "Session started"
        );
        Ok(handle)
    }

    /// Check every authenticated user's token and refresh the stale ones.
    pub async fn refresh_all(self: &Arc<Self>, now: DateTime<Utc>) -> RefreshReport {
        let users: Vec<String> = match self.auth.read() {
            Ok(auth) => auth.keys().cloned().collect(),
            Err(_) => {
                warn!("Auth state lock poisoned, skipping refresh");
                return RefreshReport::default();
            }
        };

        let mut tasks = JoinSet::new();
        for user_id in users {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = Arc::clone(&this.refresh_permits).acquire_owned().await.ok();
                let outcome = timeout(
                    this.config.per_user_timeout(),
                    this.refresh_user(&user_id, now),
                )
                .await;
                (user_id, outcome)
            });
        }

        let mut report = RefreshReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(RefreshOutcome::Unchanged))) => report.unchanged += 1,
                Ok((_, Ok(RefreshOutcome::Refreshed))) => report.refreshed += 1,
                Ok((_, Ok(RefreshOutcome::Expired))) => report.expired += 1,
                Ok((_, Ok(RefreshOutcome::Failed))) => report.failed += 1,
                Ok((user_id, Err(_))) => {
                    warn!(user = %user_id, "Token refresh timed out, keeping stale token");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh task failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Advance idle states and request termination of culled sessions.
    ///
    /// A failed termination stays Culled and is requested again next sweep.
    pub async fn cull_idle(self: &Arc<Self>, now: DateTime<Utc>) -> CullReport {
        if !self.config.culling_enabled() {
            return CullReport::default();
        }

        let culled = match self.registry.sweep(
            now,
            self.config.idle_after(),
            self.config.idle_timeout(),
        ) {
            Ok(culled) => culled,
            Err(e) => {
                warn!(error = %e, "Idle sweep failed");
                return CullReport::default();
            }
        };

        let mut report = CullReport {
            requested: culled.len(),
            ..CullReport::default()
        };

        let mut tasks = JoinSet::new();
        for (user_id, handle) in culled {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = Arc::clone(&this.cull_permits).acquire_owned().await.ok();
                let result = match timeout(
                    this.config.per_user_timeout(),
                    this.orchestrator.terminate_session(&handle),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("termination request timed out")),
                };
                (user_id, handle, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((user_id, handle, Ok(()))) => {
                    match self.registry.acknowledge_termination(&user_id, &handle) {
                        Ok(_) => {
                            info!(user = %user_id, handle = %handle, "Idle session terminated");
                            report.terminated += 1;
                        }
                        Err(e) => {
                            warn!(user = %user_id, error = %e, "Failed to forget terminated session");
                            report.failed += 1;
                        }
                    }
                }
                Ok((user_id, handle, Err(e))) => {
                    warn!(
                        user = %user_id,
                        handle = %handle,
                        error = %format!("{e:#}"),
                        "Session termination failed, retrying next sweep"
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Session termination task failed");
                    report.failed += 1;
                }
            }
        }

        if report.requested > 0 {
            info!(
                requested = report.requested,
                terminated = report.terminated,
                failed = report.failed,
                "Idle cull completed"
            );
        }
        report
    }

    /// Align session records with the platform's live list.
    ///
    /// `listed_at` must be taken before the listing is requested. Extra
    /// sessions of a user that already has one are terminated.
    pub async fn reconcile(&self, listed_at: DateTime<Utc>) -> anyhow::Result<ReconcileReport> {
        let live = timeout(
            self.config.per_user_timeout(),
            self.orchestrator.list_sessions(),
        )
        .await
        .context("Session listing timed out")??;

        let report = self.registry.reconcile(&live, listed_at)?;
        for (user_id, handle) in &report.orphaned {
            match timeout(
                self.config.per_user_timeout(),
                self.orchestrator.terminate_session(handle),
            )
            .await
            {
                Ok(Ok(())) => info!(user = %user_id, handle = %handle, "Extra session terminated"),
                Ok(Err(e)) => warn!(
                    user = %user_id,
                    handle = %handle,
                    error = %format!("{e:#}"),
                    "Extra session termination failed, retrying next reconcile"
                ),
                Err(_) => warn!(
                    user = %user_id,
                    handle = %handle,
                    "Extra session termination timed out, retrying next reconcile"
                ),
            }
        }

        if report != ReconcileReport::default() {
            info!(
                adopted = report.adopted,
                dropped = report.dropped,
                touched = report.touched,
                orphaned = report.orphaned.len(),
                "Sessions reconciled"
            );
        } else {
            debug!(live = live.len(), "Sessions in sync");
        }
        Ok(report)
    }

    /// Activity signal from the platform.
    pub fn record_activity(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        self.registry.record_activity(user_id, at).map_err(state_error)
    }

    /// Load persisted auth states. Users whose refresh token already expired
    /// stay NoAuth and are removed from the store.
    pub fn restore_from_store(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut restored = 0;
        for state in store.load_all()? {
            if state.token.evaluate(now) == TokenStatus::Expired {
                debug!(user = %state.user_id, "Discarding expired auth state");
                store.delete(&state.user_id)?;
                continue;
            }
            self.auth
                .write()
                .map_err(|_| anyhow!("Lock poisoned"))?
                .insert(
                    state.user_id,
                    UserAuth {
                        token: state.token,
                        username: state.username,
                    },
                );
            restored += 1;
        }

        info!(restored, "Auth state restored");
        Ok(restored)
    }

    fn auth_of(&self, user_id: &str) -> Result<Option<UserAuth>, CoordinatorError> {
        let auth = self
            .auth
            .read()
            .map_err(|_| CoordinatorError::State("Lock poisoned".to_string()))?;
        Ok(auth.get(user_id).cloned())
    }

    fn begin_spawn(&self, user_id: &str) -> Result<PendingSpawn<'_>, CoordinatorError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CoordinatorError::State("Lock poisoned".to_string()))?;
        if pending.contains_key(user_id) || self.registry.contains(user_id).map_err(state_error)? {
            return Err(CoordinatorError::AlreadyActive(user_id.to_string()));
        }
        pending.insert(user_id.to_string(), UserPhase::PreSpawnPending);

        Ok(PendingSpawn {
            pending: &self.pending,
            user_id: user_id.to_string(),
        })
    }

    /// Auth to spawn with, refreshed first when stale.
    async fn prepare_auth(&self, user_id: &str) -> Result<UserAuth, CoordinatorError> {
        let lock = self.refresher.user_lock(user_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let current = self
            .auth_of(user_id)?
            .ok_or_else(|| CoordinatorError::NotAuthenticated(user_id.to_string()))?;

        match self.refresher.evaluate(&current.token, now) {
            TokenStatus::Valid => Ok(current),
            TokenStatus::Expired => {
                self.expire(user_id);
                Err(CoordinatorError::NotAuthenticated(user_id.to_string()))
            }
            TokenStatus::NeedsRefresh if self.config.refresh_pre_spawn => {
                match timeout(
                    self.config.per_user_timeout(),
                    self.refresher.refresh_locked(user_id, &current.token, now),
                )
                .await
                {
                    Ok(Ok(refreshed)) => Ok(self.replace_auth(user_id, refreshed, now)),
                    Ok(Err(e)) => {
                        warn!(user = %user_id, error = %e, "Pre-spawn refresh failed, using current token");
                        Ok(current)
                    }
                    Err(_) => {
                        warn!(user = %user_id, "Pre-spawn refresh timed out, using current token");
                        Ok(current)
                    }
                }
            }
            TokenStatus::NeedsRefresh => Ok(current),
        }
    }

    async fn fetch_secrets(&self, user_id: &str, auth: &UserAuth) -> SecretBundle {
        let Some(fetcher) = &self.secrets else {
            return SecretBundle::default();
        };

        match timeout(
            self.config.per_user_timeout(),
            fetcher.fetch(auth.token.access_token(), user_id),
        )
        .await
        {
            Ok(Ok(bundle)) => bundle,
            Ok(Err(e)) => {
                warn!(user = %user_id, error = %e, "Secret fetch failed, spawning without secrets");
                SecretBundle::default()
            }
            Err(_) => {
                warn!(user = %user_id, "Secret fetch timed out, spawning without secrets");
                SecretBundle::default()
            }
        }
    }

    async fn refresh_user(&self, user_id: &str, now: DateTime<Utc>) -> RefreshOutcome {
        let lock = self.refresher.user_lock(user_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a pre-spawn refresh may have replaced it.
        let current = match self.auth_of(user_id) {
            Ok(Some(current)) => current,
            Ok(None) => return RefreshOutcome::Unchanged,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to read auth state");
                return RefreshOutcome::Failed;
            }
        };

        match self.refresher.evaluate(&current.token, now) {
            TokenStatus::Valid => RefreshOutcome::Unchanged,
            TokenStatus::Expired => {
                self.expire(user_id);
                RefreshOutcome::Expired
            }
            TokenStatus::NeedsRefresh => {
                match self.refresher.refresh_locked(user_id, &current.token, now).await {
                    Ok(refreshed) => {
                        self.replace_auth(user_id, refreshed, now);
                        RefreshOutcome::Refreshed
                    }
                    Err(e) => {
                        warn!(user = %user_id, error = %e, "Token refresh failed, keeping stale token");
                        RefreshOutcome::Failed
                    }
                }
            }
        }
    }

    /// Drop to NoAuth. Sessions keep running.
    fn expire(&self, user_id: &str) {
        info!(user = %user_id, "Refresh token expired, re-authentication required");
        if let Ok(mut auth) = self.auth.write() {
            auth.remove(user_id);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(user_id) {
                warn!(user = %user_id, error = %e, "Failed to delete expired auth state");
            }
        }
    }

    fn replace_auth(&self, user_id: &str, refreshed: RefreshedAuth, now: DateTime<Utc>) -> UserAuth {
        let auth = UserAuth {
            token: refreshed.token,
            username: refreshed.username,
        };
        if let Ok(mut map) = self.auth.write() {
            map.insert(user_id.to_string(), auth.clone());
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&stored(user_id, &auth, now)) {
                warn!(user = %user_id, error = %e, "Failed to persist refreshed auth state");
            }
        }
        auth
    }
}

fn stored(user_id: &str, auth: &UserAuth, now: DateTime<Utc>) -> StoredAuthState {
    StoredAuthState {
        user_id: user_id.to_string(),
        username: auth.username.clone(),
        token: auth.token.clone(),
        updated_at: now,
    }
}
