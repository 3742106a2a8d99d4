use std::{
    collections::HashMap,
    sync::{Arc, Mutex, atomic::AtomicU64},
    time::Duration,
};

use tokio::{sync::Semaphore, time::Instant};
use uuid::Uuid;

use crate::manager::types::PoolScaler;

/// Registry of periodic pool checks, one entry per template.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) entries: Arc<Mutex<HashMap<Uuid, Schedule>>>,
    pub(crate) scaler: PoolScaler,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) next_generation: Arc<AtomicU64>,
    pub(crate) tick: Duration,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub interval: Duration,
    pub next_due: Instant,
    /// Changes on every registration; a check started under an older
    /// generation cannot retire the entry.
    pub generation: u64,
    pub in_flight: bool,
}
