//! Task execution controller.
//!
//! Runs user-submitted batch tasks as cluster jobs and keeps a warm pool of
//! shareable interactive pods per task template. Three reconciliation loops
//! do the work: dispatch, monitor and the pool scheduler ticker.

pub mod api;
pub mod cluster;
pub mod config;
pub mod manager;
pub mod scheduler;
pub mod store;
pub mod tasks;
