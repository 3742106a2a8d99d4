use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::types::{ClusterApi, ClusterError},
    config::ControllerConfig,
    scheduler::types::Scheduler,
    store::types::{StoreError, TaskStore},
    tasks::types::ValidationError,
};

/// The controller: owns the store, the cluster client and the pool
/// scheduler, and runs the dispatch and monitor loops between `start` and
/// `stop`.
#[derive(Clone)]
pub struct Manager {
    pub store: Arc<dyn TaskStore>,
    pub cluster: Arc<dyn ClusterApi>,
    pub config: Arc<ControllerConfig>,
    pub scheduler: Scheduler,
    pub(crate) shutdown: CancellationToken,
    pub(crate) handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Keeps the warm pool of one template in shape.
#[derive(Clone)]
pub struct PoolScaler {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) config: Arc<ControllerConfig>,
}

/// What the scheduler should do with a template after a pool check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Keep checking on the template's interval.
    Healthy,
    /// The pool was torn down; stop checking until the template is
    /// registered again.
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
