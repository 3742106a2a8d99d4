use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kubernetes through the in-cluster or kubeconfig credentials.
    Kube,
    /// A single Docker host.
    Docker,
    /// In-process cluster; nothing is actually run.
    Memory,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub backend: Backend,
    pub namespace: String,
    /// Claim holding every user's scratch space.
    pub userspace_claim: String,
    pub userspace_storage: String,
    pub storage_class: Option<String>,
    /// Where a job sees its own slice of the user-space claim.
    pub scratch_mount_path: String,
    /// Where a pool pod sees the whole user-space claim.
    pub userspace_mount_path: String,
    pub pool_image: String,
    /// Absolute deadline of a task job, in seconds.
    pub task_time_limit: u64,
    pub job_backoff_limit: u32,
    /// How long a dispatched task may go without a pod before it is
    /// considered lost, in seconds.
    pub pod_startup_grace: u64,
    pub daemon_workers: usize,
    pub idle_backoff_ms: u64,
    pub tick_ms: u64,
    pub listen: String,
    /// SQLite database file. The store lives in memory when unset.
    pub database: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            backend: Backend::Kube,
            namespace: "task-controller".to_string(),
            userspace_claim: "userspace".to_string(),
            userspace_storage: "1024Gi".to_string(),
            storage_class: Some("cephfs".to_string()),
            scratch_mount_path: "/mnt/scratch/".to_string(),
            userspace_mount_path: "/mnt/userspace/".to_string(),
            pool_image: "ubuntu:22.04".to_string(),
            task_time_limit: 3600,
            job_backoff_limit: 3,
            pod_startup_grace: 0,
            daemon_workers: 2,
            idle_backoff_ms: 1000,
            tick_ms: 100,
            listen: "0.0.0.0:8080".to_string(),
            database: None,
        }
    }
}

impl ControllerConfig {
    /// Reads a TOML file; every missing key keeps its default.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(ControllerConfig::default()),
        }
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn pod_startup_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pod_startup_grace as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ControllerConfig = toml::from_str(
            r#"
            backend = "docker"
            namespace = "batch"
            daemon_workers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Docker);
        assert_eq!(config.namespace, "batch");
        assert_eq!(config.daemon_workers, 4);
        assert_eq!(config.task_time_limit, 3600);
        assert_eq!(config.job_backoff_limit, 3);
        assert_eq!(config.idle_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_without_file() {
        let config = ControllerConfig::load(None).unwrap();
        assert_eq!(config.userspace_claim, "userspace");
        assert!(config.database.is_none());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(toml::from_str::<ControllerConfig>(r#"backend = "nomad""#).is_err());
    }
}
