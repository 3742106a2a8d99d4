use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Manager, ManagerError, ManagerResult, PoolOutcome, PoolScaler};
use crate::{
    cluster::types::{ClaimSpec, ClusterApi, ClusterResult, ignore_already_exists},
    config::ControllerConfig,
    scheduler::types::Scheduler,
    store::types::{StoreError, TaskStore},
    tasks::{
        config::validate_settings,
        state::valid_state_transition,
        types::{State, Task, TaskSettings, ValidationError},
    },
};

const DELETE_ATTEMPTS: usize = 3;

/// Makes sure the namespace and the shared user-space claim exist.
///
/// `Ok(false)` means the claim could not be read back after creating it.
pub(crate) async fn ensure_workspace(
    cluster: &dyn ClusterApi,
    config: &ControllerConfig,
) -> ClusterResult<bool> {
    ignore_already_exists(cluster.ensure_namespace().await)?;
    let claim = ClaimSpec {
        name: config.userspace_claim.clone(),
        storage: config.userspace_storage.clone(),
        storage_class: config.storage_class.clone(),
    };
    ignore_already_exists(cluster.ensure_claim(&claim).await)?;
    cluster.claim_exists(&config.userspace_claim).await
}

impl Manager {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn TaskStore>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        let config = Arc::new(config);
        let scaler = PoolScaler::new(store.clone(), cluster.clone(), config.clone());
        let scheduler = Scheduler::new(scaler, config.daemon_workers, config.tick());
        info!("Task controller initialized");
        Manager {
            store,
            cluster,
            config,
            scheduler,
            shutdown: CancellationToken::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers every stored template and spawns the dispatch loop, the
    /// monitor loop and the scheduler ticker. Calling it twice is harmless.
    pub async fn start(&self) -> ManagerResult<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            info!("Task controller already started");
            return Ok(());
        }

        for settings in self.store.list_settings()? {
            if let Err(e) = self.scheduler.register(&settings) {
                warn!("Task settings {} ignored: {}", settings.id, e);
            }
        }

        handles.push(tokio::spawn(self.clone().run_dispatch()));
        handles.push(tokio::spawn(self.clone().run_monitor()));
        handles.push(tokio::spawn(
            self.scheduler.clone().run(self.shutdown.clone()),
        ));
        info!("Task controller started");
        Ok(())
    }

    /// Signals every loop to exit after its current cycle and waits for
    /// them. A stopped manager cannot be started again.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Controller loop ended abnormally: {}", e);
            }
        }
        info!("Task controller stopped");
    }

    /// Waits before the next loop cycle: a yield after a cycle that changed
    /// something, the idle backoff otherwise. Returns true once shut down.
    pub(crate) async fn wait_next_cycle(&self, progressed: usize) -> bool {
        if progressed > 0 {
            tokio::task::yield_now().await;
            return self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.idle_backoff()) => false,
        }
    }

    /// Runs the pool check of one template now.
    pub async fn check_pool(&self, id: &Uuid) -> PoolOutcome {
        self.scheduler.check_now(id).await
    }

    /// Writes `task` if nobody changed it since it was read. A conflict is
    /// not an error for the loops: the next cycle sees the fresh record.
    pub(crate) fn save_task(&self, task: &Task) -> Option<Task> {
        match self.store.update_task(task) {
            Ok(stored) => Some(stored),
            Err(StoreError::Conflict { .. }) => {
                debug!("Task {} changed concurrently, retrying next cycle", task.id);
                None
            }
            Err(e) => {
                warn!("Failed to save task {}: {}", task.id, e);
                None
            }
        }
    }

    /// Moves a task to FAILED with `diagnostic` as its logs. Returns whether
    /// the write went through.
    pub(crate) fn fail_task(&self, mut task: Task, diagnostic: String) -> bool {
        if !valid_state_transition(&task.state, &State::Failed) {
            return false;
        }
        warn!("Task {} failed: {}", task.id, diagnostic);
        task.state = State::Failed;
        task.logs = diagnostic;
        task.logs_fetched = true;
        self.save_task(&task).is_some()
    }

    pub fn list_settings(&self) -> ManagerResult<Vec<TaskSettings>> {
        Ok(self.store.list_settings()?)
    }

    pub fn get_settings(&self, id: &Uuid) -> ManagerResult<TaskSettings> {
        self.store
            .get_settings(id)?
            .ok_or(ManagerError::Store(StoreError::SettingsNotFound(*id)))
    }

    /// Stores a new template and schedules its pool check.
    pub fn create_settings(&self, settings: TaskSettings) -> ManagerResult<TaskSettings> {
        check_settings(&settings)?;
        self.store.insert_settings(&settings)?;
        self.scheduler.register(&settings)?;
        info!("Task settings {} created", settings.id);
        Ok(settings)
    }

    /// Replaces a template; its pool check restarts with the new interval.
    pub fn update_settings(&self, settings: TaskSettings) -> ManagerResult<TaskSettings> {
        check_settings(&settings)?;
        self.store.update_settings(&settings)?;
        self.scheduler.register(&settings)?;
        info!("Task settings {} updated", settings.id);
        Ok(settings)
    }

    /// Removes a template, asks for deletion of its tasks and tears its
    /// pool down before returning.
    pub async fn delete_settings(&self, id: &Uuid) -> ManagerResult<()> {
        self.store.delete_settings(id)?;
        for task in self.store.list_tasks()? {
            if task.settings_id != *id {
                continue;
            }
            if let Err(e) = self.request_deletion(&task.id) {
                warn!("Failed to delete task {} of settings {}: {}", task.id, id, e);
            }
        }
        self.scheduler.unregister(id).await;
        info!("Task settings {} deleted", id);
        Ok(())
    }

    pub fn list_tasks(&self) -> ManagerResult<Vec<Task>> {
        Ok(self.store.list_tasks()?)
    }

    pub fn get_task(&self, id: &Uuid) -> ManagerResult<Task> {
        self.store
            .get_task(id)?
            .ok_or(ManagerError::Store(StoreError::TaskNotFound(*id)))
    }

    /// Queues a new run of a template.
    pub fn submit_task(
        &self,
        settings_id: &Uuid,
        user_id: &str,
        username: &str,
    ) -> ManagerResult<Task> {
        let settings = self.get_settings(settings_id)?;
        let task = Task::new(settings.id, user_id, username);
        self.store.insert_task(&task)?;
        info!("Task {} scheduled for settings {}", task.id, settings.id);
        Ok(task)
    }

    /// Marks a task for removal; the monitor loop reaps it.
    pub fn request_deletion(&self, id: &Uuid) -> ManagerResult<Task> {
        let mut last_conflict = None;
        for _ in 0..DELETE_ATTEMPTS {
            let mut task = self.get_task(id)?;
            if task.state == State::Deleting {
                return Ok(task);
            }
            task.state = State::Deleting;
            match self.store.update_task(&task) {
                Ok(stored) => {
                    info!("Task {} marked for deletion", id);
                    return Ok(stored);
                }
                Err(e @ StoreError::Conflict { .. }) => last_conflict = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManagerError::Store(
            last_conflict.unwrap_or(StoreError::TaskNotFound(*id)),
        ))
    }
}

fn check_settings(settings: &TaskSettings) -> Result<(), ValidationError> {
    validate_settings(settings).map(|_| ())
}
