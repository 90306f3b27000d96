//! Application layer: the engine components and the orchestrator that runs
//! them in order.
//!
//! Components are short-lived views over a shared [`context::EngineContext`];
//! all state lives in the datastore, so any component can be re-run safely.

pub mod closer;
pub mod context;
pub mod deadline;
pub mod effects;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod payout;
pub mod reminders;
pub mod reserve;
pub mod starter;
pub mod webhooks;
