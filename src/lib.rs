//! Cycle progression engine for rotating savings circles.
//!
//! Drives every circle cycle from `scheduled` to `closed`: opening
//! collection, applying the circle's shortfall policy at the deadline,
//! backstopping from the community reserve, paying the recipient and moving
//! the circle on. See [`application::orchestrator::CycleEngine`].

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
