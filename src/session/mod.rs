//! Session bookkeeping.
//!
//! Running sessions are tracked in memory by the [`SessionRegistry`]; token
//! snapshots persist in the redb-backed [`AuthStateStore`].

pub mod registry;
pub mod store;
pub mod types;

pub use registry::{ReconcileReport, SessionRegistry};
pub use store::{AuthStateStore, StoredAuthState};
pub use types::{SessionHandle, SessionRecord, SessionState};
