use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Selects the pods of one task job.
pub const TASK_LABEL: &str = "app";
/// Selects the pool pods of one template.
pub const TEMPLATE_LABEL: &str = "template";
/// Number of users currently attached to a pool pod.
pub const OCCUPIED_LABEL: &str = "occupied";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    /// The request itself is wrong; retrying it will not help.
    #[error("request rejected by cluster: {0}")]
    Invalid(String),
    #[error("cluster api error: {0}")]
    Transient(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Treats creating something that already exists as success.
pub fn ignore_already_exists(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(ClusterError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}

/// Treats deleting something that is already gone as success.
pub fn ignore_not_found(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(ClusterError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// What the controller needs to know about a live pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
}

impl Pod {
    /// Unparsable or missing counters read as zero.
    pub fn occupied(&self) -> u32 {
        self.labels
            .get(OCCUPIED_LABEL)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// A persistent volume claim mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMount {
    pub volume: String,
    pub claim_name: String,
    pub mount_path: String,
    pub sub_path: Option<String>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSpec {
    pub name: String,
    pub storage: String,
    pub storage_class: Option<String>,
}

/// A run-to-completion job with a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<ClaimMount>,
    pub memory_limit: Option<String>,
    pub backoff_limit: i32,
    pub active_deadline_seconds: i64,
}

/// A long-lived, always-restarting pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub mounts: Vec<ClaimMount>,
}

/// The slice of a container cluster the controller drives. Every call is
/// scoped to the namespace the implementation was built for.
///
/// Creates report [`ClusterError::AlreadyExists`] and deletes report
/// [`ClusterError::NotFound`]; callers decide whether that is success.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn ensure_namespace(&self) -> ClusterResult<()>;

    async fn ensure_claim(&self, claim: &ClaimSpec) -> ClusterResult<()>;

    async fn claim_exists(&self, name: &str) -> ClusterResult<bool>;

    async fn create_job(&self, job: &JobSpec) -> ClusterResult<()>;

    /// Deletes the job and, in the foreground, the pods it owns.
    async fn delete_job(&self, name: &str) -> ClusterResult<()>;

    async fn list_pods(&self, label: &str, value: &str) -> ClusterResult<Vec<Pod>>;

    async fn pod_logs(&self, name: &str) -> ClusterResult<String>;

    async fn create_pod(&self, pod: &PodSpec) -> ClusterResult<()>;

    /// Merges `labels` into the pod's labels.
    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()>;

    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;
}
