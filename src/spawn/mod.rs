//! Spawn planning: form validation and launch spec construction.

pub mod config;
pub mod planner;

pub use config::{LaunchConfig, NfsVolume, DEFAULT_ENV_KEEP};
pub use planner::{plan, FormInput, LaunchSpec, VolumeMount};
