//! Session credential and lifecycle coordinator for a multi-user notebook hub.
//!
//! Keeps each user's OAuth tokens fresh, fetches per-user secrets before a
//! session starts, turns the spawn form into a launch specification, and
//! culls sessions that went idle.

pub mod access;
pub mod error;
pub mod lifecycle;
pub mod oauth;
pub mod orchestrator;
pub mod secrets;
pub mod session;
pub mod spawn;
