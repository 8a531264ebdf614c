//! Session lifecycle: spawning, periodic token refresh and idle culling.

pub mod config;
pub mod coordinator;
pub mod tasks;

pub use config::LifecycleConfig;
pub use coordinator::{CullReport, RefreshReport, SessionLifecycleCoordinator, UserPhase};
pub use tasks::{spawn_cull_task, spawn_refresh_task};
