//! Background refresh and cull tasks.
//!
//! Each task runs on its own interval so a slow refresh pass never delays
//! culling, and both stop when the shutdown token is cancelled.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::SessionLifecycleCoordinator;

/// Spawn the periodic token refresh task.
pub fn spawn_refresh_task(
    coordinator: Arc<SessionLifecycleCoordinator>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(coordinator.config().refresh_interval_secs);

    tokio::spawn(async move {
        let mut ticker = interval(period);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Refresh task stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = coordinator.refresh_all(Utc::now()).await;
            if report.refreshed > 0 || report.expired > 0 || report.failed > 0 {
                info!(
                    refreshed = report.refreshed,
                    expired = report.expired,
                    failed = report.failed,
                    "Token refresh pass completed"
                );
            } else {
                debug!(checked = report.unchanged, "Token refresh: all tokens valid");
            }
        }
    })
}

/// Spawn the idle-cull task. Each sweep first reconciles with the platform.
pub fn spawn_cull_task(
    coordinator: Arc<SessionLifecycleCoordinator>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(coordinator.config().cull_interval_secs);

    tokio::spawn(async move {
        let mut ticker = interval(period);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cull task stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = coordinator.reconcile(Utc::now()).await {
                warn!(error = %format!("{e:#}"), "Reconciliation failed, sweeping known sessions");
            }

            coordinator.cull_idle(Utc::now()).await;

            match coordinator.registry().len() {
                Ok(count) => debug!(sessions = count, "Session registry status"),
                Err(e) => debug!(error = %e, "Failed to get session count"),
            }
        }
    })
}
