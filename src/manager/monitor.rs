use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::Manager;
use crate::{
    cluster::types::{PodPhase, TASK_LABEL, ignore_not_found},
    store::types::StoreError,
    tasks::{
        state::valid_state_transition,
        types::{State, Task},
    },
};

pub const POD_NOT_FOUND: &str = "pod not found";

/// Task state a pod phase stands for. `None` leaves the task alone.
pub fn state_for_phase(phase: PodPhase) -> Option<State> {
    match phase {
        PodPhase::Pending => Some(State::Pending),
        PodPhase::Running => Some(State::Running),
        PodPhase::Succeeded => Some(State::Succeeded),
        PodPhase::Failed => Some(State::Failed),
        PodPhase::Unknown => None,
    }
}

impl Manager {
    /// Mirrors pod phases onto PENDING and RUNNING tasks, then reaps
    /// DELETING ones. Returns how many tasks changed.
    pub async fn monitor_once(&self) -> Result<usize, StoreError> {
        let mut progressed = 0;
        for task in self.store.tasks_in(&[State::Pending, State::Running])? {
            if self.reconcile_task(task).await {
                progressed += 1;
            }
        }
        for task in self.store.tasks_in(&[State::Deleting])? {
            if self.reap_task(&task).await {
                progressed += 1;
            }
        }
        Ok(progressed)
    }

    async fn reconcile_task(&self, mut task: Task) -> bool {
        let pods = match self
            .cluster
            .list_pods(TASK_LABEL, &task.id.to_string())
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Failed to list pods of task {}: {}", task.id, e);
                return false;
            }
        };

        let Some(pod) = pods.first() else {
            return self.handle_lost_task(task).await;
        };

        let Some(next) = state_for_phase(pod.phase) else {
            debug!("Pod {} of task {} is in an unknown phase", pod.name, task.id);
            return false;
        };
        if next == task.state || !valid_state_transition(&task.state, &next) {
            return false;
        }

        if next.is_terminal() && !task.logs_fetched {
            match self.cluster.pod_logs(&pod.name).await {
                Ok(logs) => {
                    task.logs = logs;
                    task.logs_fetched = true;
                }
                Err(e) => {
                    warn!("Failed to read logs of task {}: {}", task.id, e);
                    return false;
                }
            }
        }

        let previous = task.state;
        task.state = next;
        if self.save_task(&task).is_none() {
            return false;
        }
        info!("Task {} moved from {} to {}", task.id, previous, next);

        if next.is_terminal() {
            self.remove_job(&task.job_name()).await;
        }
        true
    }

    /// A dispatched task without a pod is lost once the startup grace has
    /// passed.
    async fn handle_lost_task(&self, task: Task) -> bool {
        let dispatched = task.dispatch_time.unwrap_or(task.create_time);
        if Utc::now() - dispatched < self.config.pod_startup_grace() {
            debug!("No pod yet for task {}", task.id);
            return false;
        }

        let job = task.job_name();
        if !self.fail_task(task, POD_NOT_FOUND.to_string()) {
            return false;
        }
        self.remove_job(&job).await;
        true
    }

    async fn remove_job(&self, job: &str) {
        if let Err(e) = ignore_not_found(self.cluster.delete_job(job).await) {
            warn!("Failed to delete job {}: {}", job, e);
        }
    }

    async fn reap_task(&self, task: &Task) -> bool {
        if let Err(e) = ignore_not_found(self.cluster.delete_job(&task.job_name()).await) {
            warn!("Failed to delete job of task {}: {}", task.id, e);
            return false;
        }
        match self.store.delete_task(&task.id) {
            Ok(()) => {
                info!("Task {} deleted", task.id);
                true
            }
            Err(e) => {
                warn!("Failed to delete task {}: {}", task.id, e);
                false
            }
        }
    }

    pub async fn run_monitor(self) {
        info!("Monitor loop started");
        loop {
            let progressed = match self.monitor_once().await {
                Ok(progressed) => progressed,
                Err(e) => {
                    warn!("Monitor cycle failed: {}", e);
                    0
                }
            };
            if self.wait_next_cycle(progressed).await {
                break;
            }
        }
        info!("Monitor loop stopped");
    }
}
