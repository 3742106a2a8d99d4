pub mod dispatch;
#[cfg(test)]
pub(crate) mod fixtures;
#[allow(clippy::module_inception)]
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod types;

pub use types::{Manager, ManagerError, ManagerResult, PoolOutcome, PoolScaler};
