use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{manager::ensure_workspace, types::Manager};
use crate::{
    cluster::types::{ClaimMount, ClusterError, JobSpec, TASK_LABEL, ignore_already_exists},
    config::ControllerConfig,
    store::types::StoreError,
    tasks::{
        config::parse_container_config,
        types::{ContainerConfig, State, Task, TaskSettings},
    },
};

pub const USERSPACE_UNAVAILABLE: &str = "user space storage unavailable";

/// Shell steps of a task job: prepare the working directory from the user's
/// scratch space and the shared template volume, then the user commands.
pub fn job_commands(container: &ContainerConfig, config: &ControllerConfig) -> Vec<String> {
    let working_path = &container.working_path;
    let mut commands = vec![
        format!("mkdir {}", working_path),
        format!("cp -r {} {}", config.scratch_mount_path, working_path),
        format!(
            "cp -r {} {}",
            container.persistent_volume.mount_path, working_path
        ),
    ];
    commands.extend(container.commands.iter().cloned());
    commands
}

pub fn build_job(
    task: &Task,
    settings: &TaskSettings,
    container: &ContainerConfig,
    config: &ControllerConfig,
) -> JobSpec {
    let labels = BTreeMap::from([(TASK_LABEL.to_string(), task.id.to_string())]);
    let mounts = vec![
        ClaimMount {
            volume: "shared-volume".to_string(),
            claim_name: container.persistent_volume.name.clone(),
            mount_path: container.persistent_volume.mount_path.clone(),
            sub_path: None,
            read_only: true,
        },
        ClaimMount {
            volume: "user-space".to_string(),
            claim_name: config.userspace_claim.clone(),
            mount_path: config.scratch_mount_path.clone(),
            sub_path: Some(format!("user_{}_task_{}", task.user_id, settings.id)),
            read_only: true,
        },
    ];

    JobSpec {
        name: task.job_name(),
        labels,
        image: container.image.clone(),
        command: vec![container.shell.clone()],
        args: vec!["-c".to_string(), job_commands(container, config).join(";")],
        env: vec![
            ("TASK_USER".to_string(), task.username.clone()),
            ("TASK_USER_ID".to_string(), task.user_id.clone()),
        ],
        mounts,
        memory_limit: container.memory_limit.clone(),
        backoff_limit: i32::try_from(config.job_backoff_limit).unwrap_or(i32::MAX),
        active_deadline_seconds: i64::try_from(config.task_time_limit).unwrap_or(i64::MAX),
    }
}

impl Manager {
    /// Submits every SCHEDULED task, oldest first. Returns how many tasks
    /// changed state.
    pub async fn dispatch_once(&self) -> Result<usize, StoreError> {
        let tasks = self.store.tasks_in(&[State::Scheduled])?;
        let mut progressed = 0;
        for task in tasks {
            if self.dispatch_task(task).await {
                progressed += 1;
            }
        }
        Ok(progressed)
    }

    async fn dispatch_task(&self, mut task: Task) -> bool {
        let settings = match self.store.get_settings(&task.settings_id) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                let diagnostic = format!("task settings {} not found", task.settings_id);
                return self.fail_task(task, diagnostic);
            }
            Err(e) => {
                warn!("Failed to load settings of task {}: {}", task.id, e);
                return false;
            }
        };

        let container = match parse_container_config(&settings.container_config) {
            Ok(container) => container,
            Err(e) => return self.fail_task(task, format!("invalid container config: {}", e)),
        };

        match ensure_workspace(self.cluster.as_ref(), &self.config).await {
            Ok(true) => {}
            Ok(false) => return self.fail_task(task, USERSPACE_UNAVAILABLE.to_string()),
            Err(e) => {
                warn!("Workspace not ready for task {}: {}", task.id, e);
                return false;
            }
        }

        let job = build_job(&task, &settings, &container, &self.config);
        match ignore_already_exists(self.cluster.create_job(&job).await) {
            Ok(()) => {
                task.state = State::Pending;
                task.dispatch_time = Some(Utc::now());
                let saved = self.save_task(&task).is_some();
                if saved {
                    info!("Task {} dispatched as job {}", task.id, job.name);
                }
                saved
            }
            Err(ClusterError::Invalid(reason)) => {
                self.fail_task(task, format!("job rejected by cluster: {}", reason))
            }
            Err(e) => {
                warn!("Failed to submit job for task {}: {}", task.id, e);
                false
            }
        }
    }

    pub async fn run_dispatch(self) {
        info!("Dispatch loop started");
        loop {
            let progressed = match self.dispatch_once().await {
                Ok(progressed) => progressed,
                Err(e) => {
                    warn!("Dispatch cycle failed: {}", e);
                    0
                }
            };
            if progressed > 0 {
                debug!("Dispatch cycle moved {} tasks", progressed);
            }
            if self.wait_next_cycle(progressed).await {
                break;
            }
        }
        info!("Dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::memory::Operation,
        manager::fixtures::{fixture, settings},
        store::types::TaskStore,
    };

    #[test]
    fn test_job_commands_order() {
        let container = parse_container_config(&crate::manager::fixtures::container_config())
            .unwrap();
        let config = ControllerConfig::default();
        let commands = job_commands(&container, &config);
        assert_eq!(
            commands,
            vec![
                "mkdir /workspace",
                "cp -r /mnt/scratch/ /workspace",
                "cp -r /mnt/shared /workspace",
                "cd /workspace",
                "python main.py",
            ]
        );
    }

    #[test]
    fn test_build_job() {
        let settings = settings(1, 2);
        let container = parse_container_config(&settings.container_config).unwrap();
        let task = Task::new(settings.id, "42", "alice");
        let config = ControllerConfig::default();
        let job = build_job(&task, &settings, &container, &config);

        assert_eq!(job.name, format!("task-exec-{}", task.id));
        assert_eq!(job.labels.get(TASK_LABEL), Some(&task.id.to_string()));
        assert_eq!(job.command, vec!["/bin/bash"]);
        assert_eq!(job.args[0], "-c");
        assert!(job.args[1].starts_with("mkdir /workspace;cp -r"));
        assert!(job.args[1].ends_with(";cd /workspace;python main.py"));
        assert_eq!(job.backoff_limit, 3);
        assert_eq!(job.active_deadline_seconds, 3600);
        assert_eq!(job.memory_limit.as_deref(), Some("512Mi"));
        assert!(job.mounts.iter().all(|mount| mount.read_only));
        assert_eq!(
            job.mounts[1].sub_path,
            Some(format!("user_42_task_{}", settings.id))
        );
        assert!(job.env.contains(&("TASK_USER".to_string(), "alice".to_string())));
        assert!(job.env.contains(&("TASK_USER_ID".to_string(), "42".to_string())));
    }

    #[tokio::test]
    async fn test_dispatch_moves_task_to_pending() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 1);

        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Pending);
        assert!(stored.dispatch_time.is_some());
        assert!(f.cluster.job(&task.job_name()).is_some());
        assert!(f.cluster.has_claim("userspace"));
    }

    #[tokio::test]
    async fn test_dispatch_is_fifo_and_submits_once() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let first = Task::new(settings.id, "1", "alice");
        let mut second = Task::new(settings.id, "2", "bob");
        second.create_time = first.create_time + chrono::Duration::seconds(1);
        f.store.insert_task(&second).unwrap();
        f.store.insert_task(&first).unwrap();

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 2);
        assert_eq!(f.manager.dispatch_once().await.unwrap(), 0);
        assert_eq!(
            f.cluster.submitted_jobs(),
            vec![first.job_name(), second.job_name()]
        );
    }

    #[tokio::test]
    async fn test_missing_settings_fails_without_cluster_call() {
        let f = fixture();
        let task = Task::new(uuid::Uuid::new_v4(), "1", "alice");
        f.store.insert_task(&task).unwrap();

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 1);
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.logs_fetched);
        assert!(stored.logs.contains("not found"));
        assert_eq!(f.cluster.calls(Operation::CreateJob), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_without_cluster_call() {
        let f = fixture();
        let mut settings = settings(1, 2);
        settings.container_config = r#"{"image": "python:3.11"}"#.to_string();
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();

        f.manager.dispatch_once().await.unwrap();
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.logs.starts_with("invalid container config"));
        assert_eq!(f.cluster.calls(Operation::EnsureNamespace), 0);
        assert_eq!(f.cluster.calls(Operation::CreateJob), 0);
    }

    #[tokio::test]
    async fn test_transient_submit_keeps_task_scheduled() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();
        f.cluster.fail_next(
            Operation::CreateJob,
            ClusterError::Transient("connection reset".to_string()),
        );

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 0);
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert_eq!(stored.version, 0);

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 1);
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Pending);
    }

    #[tokio::test]
    async fn test_rejected_job_fails_task() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();
        f.cluster.fail_next(
            Operation::CreateJob,
            ClusterError::Invalid("bad memory quantity".to_string()),
        );

        f.manager.dispatch_once().await.unwrap();
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.logs.contains("bad memory quantity"));
    }

    #[tokio::test]
    async fn test_existing_job_counts_as_submitted() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();
        f.cluster.fail_next(
            Operation::CreateJob,
            ClusterError::AlreadyExists(task.job_name()),
        );

        f.manager.dispatch_once().await.unwrap();
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Pending);
    }

    #[tokio::test]
    async fn test_workspace_failure_keeps_task_scheduled() {
        let f = fixture();
        let settings = settings(1, 2);
        f.store.insert_settings(&settings).unwrap();
        let task = Task::new(settings.id, "1", "alice");
        f.store.insert_task(&task).unwrap();
        f.cluster.fail_next(
            Operation::EnsureClaim,
            ClusterError::Transient("api unavailable".to_string()),
        );

        assert_eq!(f.manager.dispatch_once().await.unwrap(), 0);
        let stored = f.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert_eq!(f.cluster.calls(Operation::CreateJob), 0);
    }
}
