//! Session record types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier the orchestration platform assigns to a running session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Activity state of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Recently used.
    Active,
    /// No activity seen for at least one sweep interval.
    Idle,
    /// Past the idle timeout; termination requested until acknowledged.
    Culled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Culled => write!(f, "culled"),
        }
    }
}

/// A user's running session as tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub handle: SessionHandle,
    /// When the coordinator started or adopted the session.
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionRecord {
    /// A freshly started (or adopted) session, last active at `started_at`.
    pub fn new(user_id: String, handle: SessionHandle, started_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            handle,
            started_at,
            last_activity: started_at,
            state: SessionState::Active,
        }
    }

    /// Time since the last activity signal.
    pub fn inactive_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity
    }

    /// Fold in an activity signal. Older signals are ignored and culled
    /// sessions stay culled.
    pub fn touch(&mut self, at: DateTime<Utc>) -> bool {
        if at <= self.last_activity {
            return false;
        }
        self.last_activity = at;
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
        true
    }
}
