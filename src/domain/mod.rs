//! Domain entities, value objects and the ports the engine talks through.

pub mod circle;
pub mod contribution;
pub mod cycle;
pub mod ledger;
pub mod money;
pub mod ports;
