//! Orchestration platform seam.
//!
//! The platform owns the session containers. The coordinator only asks it to
//! create, terminate and list sessions.

pub mod config;
pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionHandle;
use crate::spawn::LaunchSpec;

pub use config::OrchestratorConfig;
pub use http::HttpOrchestrator;

/// A session the platform reports as live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    #[serde(rename = "id")]
    pub handle: SessionHandle,
    pub user: String,
    /// Last activity the platform observed, when it tracks it.
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Session operations offered by the orchestration platform.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start a session for `user_id`.
    async fn create_session(&self, user_id: &str, spec: &LaunchSpec) -> Result<SessionHandle>;

    /// Request termination. `Ok` means the platform acknowledged it.
    async fn terminate_session(&self, handle: &SessionHandle) -> Result<()>;

    /// Every live session, in platform order.
    async fn list_sessions(&self) -> Result<Vec<LiveSession>>;
}
