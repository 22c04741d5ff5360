//! Aqueduct - cross-chain TWAP bridge orchestrator
//!
//! Executes large swap orders as time-weighted schedules across
//! heterogeneous ledgers and settles them atomically through HTLC pairs.

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod twap;
