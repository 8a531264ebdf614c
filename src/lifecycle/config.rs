//! Lifecycle timing configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Timers and limits for refresh and culling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Seconds between periodic token checks.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Seconds between idle-cull sweeps. Also the quiet time after which an
    /// active session is marked idle.
    #[serde(default = "default_cull_interval")]
    pub cull_interval_secs: u64,

    /// Seconds of inactivity before a session is culled. 0 disables culling.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Upper bound on a single user's refresh, secret fetch or termination.
    #[serde(default = "default_per_user_timeout")]
    pub per_user_timeout_secs: u64,

    /// Per-user operations in flight during one sweep.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_user_tasks: usize,

    /// Refresh a stale access token before spawning.
    #[serde(default = "default_true")]
    pub refresh_pre_spawn: bool,
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_cull_interval() -> u64 {
    600
}

fn default_per_user_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    16
}

fn default_true() -> bool {
    true
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            cull_interval_secs: default_cull_interval(),
            idle_timeout_secs: 0,
            per_user_timeout_secs: default_per_user_timeout(),
            max_concurrent_user_tasks: default_max_concurrent(),
            refresh_pre_spawn: true,
        }
    }
}

impl LifecycleConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.refresh_interval_secs == 0 {
            return Err("Refresh interval must be greater than zero".to_string());
        }

        if self.cull_interval_secs == 0 {
            return Err("Cull interval must be greater than zero".to_string());
        }

        if self.per_user_timeout_secs == 0 {
            return Err("Per-user timeout must be greater than zero".to_string());
        }

        if self.max_concurrent_user_tasks == 0 {
            return Err("At least one concurrent user task is required".to_string());
        }

        Ok(())
    }

    pub fn culling_enabled(&self) -> bool {
        self.idle_timeout_secs > 0
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::seconds(self.idle_timeout_secs as i64)
    }

    /// Quiet time after which an active session counts as idle.
    pub fn idle_after(&self) -> Duration {
        Duration::seconds(self.cull_interval_secs as i64)
    }

    pub fn per_user_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.per_user_timeout_secs)
    }
}
