#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod types;

pub use types::{Schedule, Scheduler};
