//! Auth state store backed by redb embedded database.
//!
//! Keeps each user's latest token snapshot across coordinator restarts so
//! running sessions can keep being refreshed without a new login.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::oauth::TokenState;

/// redb table for auth states (key: user id, value: MessagePack bytes).
const AUTH_STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("auth_states");

/// Persisted auth state of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAuthState {
    pub user_id: String,
    /// Username reported by the identity provider.
    pub username: String,
    pub token: TokenState,
    pub updated_at: DateTime<Utc>,
}

/// Persistent auth state store.
pub struct AuthStateStore {
    db: Database,
}

impl AuthStateStore {
    /// Open or create a store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open auth state database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(AUTH_STATES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert or replace a user's auth state.
    pub fn save(&self, state: &StoredAuthState) -> Result<()> {
        let data = rmp_serde::to_vec(state).context("Failed to serialize auth state")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUTH_STATES_TABLE)?;
            table.insert(state.user_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load(&self, user_id: &str) -> Result<Option<StoredAuthState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUTH_STATES_TABLE)?;

        match table.get(user_id)? {
            Some(value) => {
                let state = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize auth state")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Delete a user's auth state.
    pub fn delete(&self, user_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(AUTH_STATES_TABLE)?;
            let result = table.remove(user_id)?;
            result.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Load every readable auth state. Undecodable entries are skipped.
    pub fn load_all(&self) -> Result<Vec<StoredAuthState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUTH_STATES_TABLE)?;

        let mut states = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<StoredAuthState>(value.value()) {
                Ok(state) => states.push(state),
                Err(e) => {
                    warn!(user = key.value(), error = %e, "Failed to deserialize auth state, skipping");
                }
            }
        }

        debug!(count = states.len(), "Loaded auth states");
        Ok(states)
    }

    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUTH_STATES_TABLE)?;
        Ok(table.len()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::token::tests::token_state;
    use chrono::Duration;
    use tempfile::tempdir;

    fn stored(user: &str) -> StoredAuthState {
        let now = Utc::now();
        StoredAuthState {
            user_id: user.to_string(),
            username: user.to_string(),
            token: token_state(now + Duration::seconds(300), now + Duration::seconds(1800)),
            updated_at: now,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = AuthStateStore::open(dir.path().join("auth.redb")).unwrap();

        let state = stored("alice");
        store.save(&state).unwrap();

        let loaded = store.load("alice").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load("bob").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("auth.redb");
        {
            let store = AuthStateStore::open(path.clone()).unwrap();
            store.save(&stored("alice")).unwrap();
            store.save(&stored("bob")).unwrap();
        }

        let store = AuthStateStore::open(path).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        let mut users: Vec<String> = store.load_all().unwrap().into_iter().map(|s| s.user_id).collect();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = AuthStateStore::open(dir.path().join("auth.redb")).unwrap();
        store.save(&stored("alice")).unwrap();

        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }
}
