//! In-memory set of session records, keyed by user.
//!
//! Every mutation takes the map lock for a single read-modify-write and never
//! across an await, so concurrent sweep and activity updates cannot lose
//! each other's changes.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{SessionHandle, SessionRecord, SessionState};
use crate::orchestrator::LiveSession;

/// Result of reconciling against the platform's live list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live sessions the registry did not know about.
    pub adopted: usize,
    /// Records whose session no longer exists.
    pub dropped: usize,
    /// Records that received newer activity from the listing.
    pub touched: usize,
    /// Live sessions of users that already have a tracked session. They are
    /// not tracked and should be terminated.
    pub orphaned: Vec<(String, SessionHandle)>,
}

/// Session records owned by the coordinator.
#[derive(Default)]
pub struct SessionRegistry {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly started session.
    pub fn insert(&self, record: SessionRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| anyhow!("Lock poisoned"))?;
        records.insert(record.user_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<SessionRecord>> {
        let records = self.records.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(records.get(user_id).cloned())
    }

    pub fn contains(&self, user_id: &str) -> Result<bool> {
        let records = self.records.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(records.contains_key(user_id))
    }

    pub fn len(&self) -> Result<usize> {
        let records = self.records.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(records.len())
    }

    /// Apply an activity signal. Returns false when the user has no record
    /// or the signal is older than what is already known.
    pub fn record_activity(&self, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records.write().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(records
            .get_mut(user_id)
            .map(|record| record.touch(at))
            .unwrap_or(false))
    }

    /// Advance idle states at `now` and return every session awaiting
    /// termination (newly culled and still unacknowledged).
    ///
    /// Active records quiet for longer than `idle_after` become Idle; Active
    /// or Idle records quiet for longer than `idle_timeout` become Culled.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        idle_after: Duration,
        idle_timeout: Duration,
    ) -> Result<Vec<(String, SessionHandle)>> {
        let mut records = self.records.write().map_err(|_| anyhow!("Lock poisoned"))?;
        let mut to_terminate = Vec::new();

        for record in records.values_mut() {
            let inactive = record.inactive_for(now);

            if record.state != SessionState::Culled && inactive > idle_timeout {
                info!(
                    user = %record.user_id,
                    handle = %record.handle,
                    inactive_secs = inactive.num_seconds(),
                    "Culling idle session"
                );
                record.state = SessionState::Culled;
            } else if record.state == SessionState::Active && inactive > idle_after {
                debug!(user = %record.user_id, "Session idle");
                record.state = SessionState::Idle;
            }

            if record.state == SessionState::Culled {
                to_terminate.push((record.user_id.clone(), record.handle.clone()));
            }
        }

        Ok(to_terminate)
    }

    /// Drop a culled record once the platform acknowledged its termination.
    ///
    /// A record that was replaced in the meantime (different handle) is kept.
    pub fn acknowledge_termination(&self, user_id: &str, handle: &SessionHandle) -> Result<bool> {
        let mut records = self.records.write().map_err(|_| anyhow!("Lock poisoned"))?;
        let matches = records
            .get(user_id)
            .is_some_and(|r| r.state == SessionState::Culled && &r.handle == handle);
        if matches {
            records.remove(user_id);
        }
        Ok(matches)
    }

    /// Make the registry agree with the platform's live list, requested at
    /// `listed_at`.
    ///
    /// The platform is authoritative for which sessions exist; the registry
    /// keeps its own states (e.g. Culled) for sessions that are still live.
    /// Records started at or after `listed_at` are kept even when missing:
    /// the listing predates them.
    pub fn reconcile(
        &self,
        live: &[LiveSession],
        listed_at: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let mut records = self.records.write().map_err(|_| anyhow!("Lock poisoned"))?;
        let mut report = ReconcileReport::default();

        let live_handles: HashSet<&SessionHandle> = live.iter().map(|s| &s.handle).collect();
        let before = records.len();
        records.retain(|_, record| {
            live_handles.contains(&record.handle) || record.started_at >= listed_at
        });
        report.dropped = before - records.len();

        for session in live {
            match records.get_mut(&session.user) {
                Some(record) if record.handle == session.handle => {
                    if let Some(at) = session.last_activity {
                        if record.touch(at) {
                            report.touched += 1;
                        }
                    }
                }
                Some(record) => {
                    warn!(
                        user = %session.user,
                        tracked = %record.handle,
                        live = %session.handle,
                        "Untracked extra session for user"
                    );
                    report
                        .orphaned
                        .push((session.user.clone(), session.handle.clone()));
                }
                None => {
                    let mut record = SessionRecord::new(
                        session.user.clone(),
                        session.handle.clone(),
                        listed_at,
                    );
                    if let Some(at) = session.last_activity {
                        record.last_activity = at;
                    }
                    records.insert(session.user.clone(), record);
                    report.adopted += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(s: &str) -> SessionHandle {
        SessionHandle(s.to_string())
    }

    fn registry_with(user: &str, last_activity: DateTime<Utc>) -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry
            .insert(SessionRecord::new(
                user.to_string(),
                handle(&format!("pod-{user}")),
                last_activity,
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_sweep_marks_idle_then_culled() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(120));

        let culled = registry
            .sweep(now, Duration::seconds(60), Duration::seconds(3600))
            .unwrap();
        assert!(culled.is_empty());
        assert_eq!(registry.get("alice").unwrap().unwrap().state, SessionState::Idle);

        let later = now + Duration::seconds(3600);
        let culled = registry
            .sweep(later, Duration::seconds(60), Duration::seconds(3600))
            .unwrap();
        assert_eq!(culled, vec![("alice".to_string(), handle("pod-alice"))]);
        assert_eq!(registry.get("alice").unwrap().unwrap().state, SessionState::Culled);
    }

    #[test]
    fn test_sweep_repeats_culled_until_acknowledged() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(7200));
        let idle_after = Duration::seconds(60);
        let timeout = Duration::seconds(3600);

        assert_eq!(registry.sweep(now, idle_after, timeout).unwrap().len(), 1);
        assert_eq!(registry.sweep(now, idle_after, timeout).unwrap().len(), 1);

        assert!(registry
            .acknowledge_termination("alice", &handle("pod-alice"))
            .unwrap());
        assert!(registry.sweep(now, idle_after, timeout).unwrap().is_empty());
        assert!(!registry.contains("alice").unwrap());
    }

    #[test]
    fn test_acknowledge_ignores_replaced_session() {
        let now = Utc::now();
        let registry = registry_with("alice", now);
        assert!(!registry
            .acknowledge_termination("alice", &handle("pod-alice"))
            .unwrap()); // not culled
        assert!(!registry
            .acknowledge_termination("alice", &handle("pod-other"))
            .unwrap());
        assert!(registry.contains("alice").unwrap());
    }

    #[test]
    fn test_activity_reactivates() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(120));
        registry
            .sweep(now, Duration::seconds(60), Duration::seconds(3600))
            .unwrap();

        assert!(registry.record_activity("alice", now).unwrap());
        assert_eq!(registry.get("alice").unwrap().unwrap().state, SessionState::Active);
        assert!(!registry.record_activity("nobody", now).unwrap());
    }

    #[test]
    fn test_reconcile() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(600));
        registry
            .insert(SessionRecord::new(
                "carol".to_string(),
                handle("pod-carol"),
                now - Duration::seconds(60),
            ))
            .unwrap();

        let live = vec![
            LiveSession {
                handle: handle("pod-alice"),
                user: "alice".to_string(),
                last_activity: Some(now - Duration::seconds(10)),
            },
            LiveSession {
                handle: handle("pod-bob"),
                user: "bob".to_string(),
                last_activity: None,
            },
        ];

        let report = registry.reconcile(&live, now).unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                adopted: 1,
                dropped: 1,
                touched: 1,
                orphaned: vec![],
            }
        );

        let bob = registry.get("bob").unwrap().unwrap();
        assert_eq!(bob.state, SessionState::Active);
        assert_eq!(bob.last_activity, now);
        assert!(!registry.contains("carol").unwrap());
        assert_eq!(
            registry.get("alice").unwrap().unwrap().last_activity,
            now - Duration::seconds(10)
        );
    }

    #[test]
    fn test_reconcile_keeps_culled_state_of_live_session() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(7200));
        registry
            .sweep(now, Duration::seconds(60), Duration::seconds(3600))
            .unwrap();

        let live = vec![LiveSession {
            handle: handle("pod-alice"),
            user: "alice".to_string(),
            last_activity: None,
        }];
        registry.reconcile(&live, now).unwrap();
        assert_eq!(registry.get("alice").unwrap().unwrap().state, SessionState::Culled);
    }

    #[test]
    fn test_reconcile_keeps_session_started_after_listing() {
        let listed_at = Utc::now();
        let registry = registry_with("bob", listed_at - Duration::seconds(300));
        // Spawned while the listing was in flight
        registry
            .insert(SessionRecord::new(
                "alice".to_string(),
                handle("pod-alice"),
                listed_at + Duration::milliseconds(5),
            ))
            .unwrap();

        let report = registry.reconcile(&[], listed_at).unwrap();
        assert_eq!(report.dropped, 1);
        assert!(registry.contains("alice").unwrap());
        assert!(!registry.contains("bob").unwrap());

        // A later listing that still lacks it is authoritative
        let report = registry
            .reconcile(&[], listed_at + Duration::seconds(60))
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert!(!registry.contains("alice").unwrap());
    }

    #[test]
    fn test_reconcile_reports_extra_live_session() {
        let now = Utc::now();
        let registry = registry_with("alice", now - Duration::seconds(60));

        let live = vec![
            LiveSession {
                handle: handle("pod-alice"),
                user: "alice".to_string(),
                last_activity: None,
            },
            LiveSession {
                handle: handle("pod-alice-2"),
                user: "alice".to_string(),
                last_activity: None,
            },
        ];

        let report = registry.reconcile(&live, now).unwrap();
        assert_eq!(
            report.orphaned,
            vec![("alice".to_string(), handle("pod-alice-2"))]
        );
        assert_eq!(registry.get("alice").unwrap().unwrap().handle, handle("pod-alice"));
    }
}
