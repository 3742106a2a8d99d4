use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, atomic::AtomicU64, atomic::Ordering},
    time::Duration,
};

use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Schedule, Scheduler};
use crate::{
    manager::types::{PoolOutcome, PoolScaler},
    tasks::{
        config::{MAX_TTL_INTERVAL, validate_settings},
        types::{TaskSettings, ValidationError},
    },
};

impl Scheduler {
    pub fn new(scaler: PoolScaler, workers: usize, tick: Duration) -> Self {
        Scheduler {
            entries: Arc::new(Mutex::new(HashMap::new())),
            scaler,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            next_generation: Arc::new(AtomicU64::new(1)),
            tick,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Schedule>> {
        // Entries stay consistent under every critical section.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedules the pool check of `settings`, replacing any earlier entry.
    /// The first check is due on the next tick. Returns the entry's
    /// generation.
    pub fn register(&self, settings: &TaskSettings) -> Result<u64, ValidationError> {
        self.cancel(&settings.id);
        validate_settings(settings)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(
            settings.id,
            Schedule {
                interval: Duration::from_secs(settings.ttl_interval),
                next_due: Instant::now(),
                generation,
                in_flight: false,
            },
        );
        info!(
            "Pool check of {} scheduled every {}s",
            settings.id, settings.ttl_interval
        );
        Ok(generation)
    }

    /// Stops checking `id`. Its pods are left alone.
    pub fn cancel(&self, id: &Uuid) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Stops checking `id` and deletes its pool pods.
    pub async fn unregister(&self, id: &Uuid) {
        if self.cancel(id) {
            info!("Pool check of {} cancelled", id);
        }
        self.scaler.teardown(id).await;
    }

    pub fn is_scheduled(&self, id: &Uuid) -> bool {
        self.entries().contains_key(id)
    }

    pub fn scheduled_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<_> = self.entries().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn generation(&self, id: &Uuid) -> Option<u64> {
        self.entries().get(id).map(|entry| entry.generation)
    }

    /// Claims every entry due at `now` that is not already being checked and
    /// pushes its next due time one interval ahead.
    pub fn due(&self, now: Instant) -> Vec<(Uuid, u64)> {
        let mut due = Vec::new();
        for (id, entry) in self.entries().iter_mut() {
            if entry.in_flight || entry.next_due > now {
                continue;
            }
            entry.next_due = now
                .checked_add(entry.interval)
                .unwrap_or_else(|| now + Duration::from_secs(MAX_TTL_INTERVAL));
            entry.in_flight = true;
            due.push((*id, entry.generation));
        }
        due
    }

    /// Records the end of a check claimed through [`Scheduler::due`].
    pub fn finish(&self, id: &Uuid, generation: u64, outcome: PoolOutcome) {
        let mut entries = self.entries();
        let retired = match entries.get_mut(id) {
            Some(entry) if entry.generation == generation => match outcome {
                PoolOutcome::Healthy => {
                    entry.in_flight = false;
                    false
                }
                PoolOutcome::Retired => true,
            },
            _ => {
                debug!("Schedule of {} replaced during its check", id);
                false
            }
        };
        if retired {
            entries.remove(id);
            info!("Pool check of {} retired", id);
        }
    }

    /// Runs one check of `id` right away, outside the ticker. A scheduled
    /// entry is claimed for the duration, so a check already running on the
    /// ticker makes this one a no-op.
    pub async fn check_now(&self, id: &Uuid) -> PoolOutcome {
        let claimed = match self.entries().get_mut(id) {
            Some(entry) if entry.in_flight => {
                debug!("Pool check of {} already running, skipping", id);
                return PoolOutcome::Healthy;
            }
            Some(entry) => {
                entry.in_flight = true;
                Some(entry.generation)
            }
            None => None,
        };
        let outcome = self.scaler.check(id).await;
        if let Some(generation) = claimed {
            self.finish(id, generation, outcome);
        }
        outcome
    }

    /// Ticks until `shutdown`, running due checks on the worker pool, then
    /// waits for the checks still running.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Pool scheduler started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = checks.join_next(), if !checks.is_empty() => continue,
                _ = ticker.tick() => {}
            }

            for (id, generation) in self.due(Instant::now()) {
                let scheduler = self.clone();
                checks.spawn(async move {
                    let outcome = match scheduler.workers.acquire().await {
                        Ok(_permit) => scheduler.scaler.check(&id).await,
                        Err(_) => PoolOutcome::Healthy,
                    };
                    scheduler.finish(&id, generation, outcome);
                });
            }
        }

        while checks.join_next().await.is_some() {}
        info!("Pool scheduler stopped");
    }
}
