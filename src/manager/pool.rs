use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    manager::ensure_workspace,
    types::{PoolOutcome, PoolScaler},
};
use crate::{
    cluster::types::{
        ClaimMount, ClusterApi, OCCUPIED_LABEL, Pod, PodPhase, PodSpec, TEMPLATE_LABEL,
        ignore_not_found,
    },
    config::ControllerConfig,
    store::types::TaskStore,
    tasks::{
        config::validate_settings,
        types::{ContainerConfig, TaskSettings},
    },
};

/// Pool pods of one template, counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolCensus {
    /// Running or starting pods.
    pub base: u32,
    /// Pods that can take another user.
    pub usable: u32,
    /// Running pods nobody uses, in listing order.
    pub idle: Vec<String>,
    /// A pod has stopped or is in an unknown phase.
    pub broken: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolPlan {
    pub create: u32,
    pub delete: Option<String>,
}

pub fn census(pods: &[Pod], max_sharing_users: u32) -> PoolCensus {
    let mut census = PoolCensus::default();
    for pod in pods {
        match pod.phase {
            PodPhase::Running => {
                census.base += 1;
                let occupied = pod.occupied();
                if occupied < max_sharing_users {
                    census.usable += 1;
                    if occupied == 0 {
                        census.idle.push(pod.name.clone());
                    }
                }
            }
            PodPhase::Pending => {
                census.base += 1;
                census.usable += 1;
            }
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown => census.broken = true,
        }
    }
    census
}

/// At most one rule fires per check, tried in order: fill up to `replica`,
/// double a saturated pool, then shed one idle pod from an oversized one.
pub fn plan(census: &PoolCensus, replica: u32) -> PoolPlan {
    let idle = census.idle.len() as u32;
    if census.base <= replica {
        PoolPlan {
            create: replica - census.base,
            delete: None,
        }
    } else if census.usable < 1 {
        PoolPlan {
            create: census.base,
            delete: None,
        }
    } else if census.base > replica && idle > census.base / 2 {
        PoolPlan {
            create: 0,
            delete: census.idle.first().cloned(),
        }
    } else {
        PoolPlan::default()
    }
}

pub fn pool_pod(
    settings: &TaskSettings,
    container: &ContainerConfig,
    config: &ControllerConfig,
) -> PodSpec {
    let suffix = Uuid::new_v4().simple().to_string();
    let labels = BTreeMap::from([
        (TEMPLATE_LABEL.to_string(), settings.id.to_string()),
        (OCCUPIED_LABEL.to_string(), "0".to_string()),
    ]);
    PodSpec {
        name: format!("pool-{}-{}", settings.id, &suffix[..8]),
        labels,
        image: config.pool_image.clone(),
        mounts: vec![
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
                mount_path: config.userspace_mount_path.clone(),
                sub_path: None,
                read_only: false,
            },
        ],
    }
}

impl PoolScaler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cluster: Arc<dyn ClusterApi>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        PoolScaler {
            store,
            cluster,
            config,
        }
    }

    /// One pool check for `template`.
    pub async fn check(&self, template: &Uuid) -> PoolOutcome {
        match ensure_workspace(self.cluster.as_ref(), &self.config).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("User space claim missing, skipping pool check of {}", template);
                return PoolOutcome::Healthy;
            }
            Err(e) => {
                warn!("Workspace not ready for pool {}: {}", template, e);
                return PoolOutcome::Healthy;
            }
        }

        let settings = match self.store.get_settings(template) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                info!("Task settings {} gone, retiring its pool", template);
                self.teardown(template).await;
                return PoolOutcome::Retired;
            }
            Err(e) => {
                warn!("Failed to load task settings {}: {}", template, e);
                return PoolOutcome::Healthy;
            }
        };
        let container = match validate_settings(&settings) {
            Ok(container) => container,
            Err(e) => {
                warn!("Task settings {} invalid, retiring its pool: {}", template, e);
                self.teardown(template).await;
                return PoolOutcome::Retired;
            }
        };

        let pods = match self
            .cluster
            .list_pods(TEMPLATE_LABEL, &template.to_string())
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Failed to list pool pods of {}: {}", template, e);
                return PoolOutcome::Healthy;
            }
        };

        let census = census(&pods, settings.max_sharing_users);
        if census.broken {
            warn!("Pool of {} has a stopped pod, tearing it down", template);
            for pod in &pods {
                self.delete_pod(template, &pod.name).await;
            }
            return PoolOutcome::Retired;
        }

        let plan = plan(&census, settings.replica);
        debug!("Pool {}: {:?} -> {:?}", template, census, plan);
        for _ in 0..plan.create {
            let pod = pool_pod(&settings, &container, &self.config);
            match self.cluster.create_pod(&pod).await {
                Ok(()) => info!("Created pool pod {}", pod.name),
                Err(e) => warn!("Failed to create pool pod for {}: {}", template, e),
            }
        }
        if let Some(name) = plan.delete {
            info!("Scaling pool of {} down", template);
            self.delete_pod(template, &name).await;
        }
        PoolOutcome::Healthy
    }

    /// Deletes every pool pod of `template`.
    pub async fn teardown(&self, template: &Uuid) {
        let pods = match self
            .cluster
            .list_pods(TEMPLATE_LABEL, &template.to_string())
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Failed to list pool pods of {}: {}", template, e);
                return;
            }
        };
        for pod in &pods {
            self.delete_pod(template, &pod.name).await;
        }
    }

    /// Detaches the pod from its pool before deleting it, so nobody picks it
    /// while it terminates.
    async fn delete_pod(&self, template: &Uuid, name: &str) {
        let detached = BTreeMap::from([
            (TEMPLATE_LABEL.to_string(), format!("{}-deleted", template)),
            (OCCUPIED_LABEL.to_string(), "0".to_string()),
        ]);
        if let Err(e) = self.cluster.patch_pod_labels(name, &detached).await {
            debug!("Failed to relabel pool pod {}: {}", name, e);
        }
        match ignore_not_found(self.cluster.delete_pod(name).await) {
            Ok(()) => info!("Deleted pool pod {}", name),
            Err(e) => warn!("Failed to delete pool pod {}: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{MemoryCluster, memory::Operation, types::ClusterError},
        manager::fixtures::settings,
        store::MemoryStore,
        tasks::config::parse_container_config,
    };

    struct Pool {
        scaler: PoolScaler,
        store: Arc<MemoryStore>,
        cluster: Arc<MemoryCluster>,
    }

    fn pool() -> Pool {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(MemoryCluster::new());
        let scaler = PoolScaler::new(
            store.clone(),
            cluster.clone(),
            Arc::new(ControllerConfig::default()),
        );
        Pool {
            scaler,
            store,
            cluster,
        }
    }

    fn labels(template: &Uuid, occupied: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TEMPLATE_LABEL.to_string(), template.to_string()),
            (OCCUPIED_LABEL.to_string(), occupied.to_string()),
        ])
    }

    fn pod(name: &str, phase: PodPhase, occupied: &str) -> Pod {
        Pod {
            name: name.to_string(),
            phase,
            labels: labels(&Uuid::nil(), occupied),
        }
    }

    fn pool_size(pool: &Pool, template: &Uuid) -> usize {
        pool.cluster
            .pods_labelled(TEMPLATE_LABEL, &template.to_string())
            .len()
    }

    #[test]
    fn test_census() {
        let pods = vec![
            pod("a", PodPhase::Running, "0"),
            pod("b", PodPhase::Running, "2"),
            pod("c", PodPhase::Running, "1"),
            pod("d", PodPhase::Pending, "0"),
            pod("e", PodPhase::Running, "lots"),
        ];
        let census = census(&pods, 2);
        assert_eq!(census.base, 5);
        assert_eq!(census.usable, 4);
        assert_eq!(census.idle, vec!["a".to_string(), "e".to_string()]);
        assert!(!census.broken);

        assert!(census_of_phase(PodPhase::Succeeded).broken);
        assert!(census_of_phase(PodPhase::Unknown).broken);
    }

    fn census_of_phase(phase: PodPhase) -> PoolCensus {
        census(&[pod("x", phase, "0")], 2)
    }

    #[test]
    fn test_plan() {
        let empty = PoolCensus::default();
        assert_eq!(plan(&empty, 3).create, 3);

        let starving = PoolCensus {
            base: 2,
            usable: 0,
            idle: vec![],
            broken: false,
        };
        assert_eq!(plan(&starving, 1).create, 2);
        // Below target the pool only fills up, even when saturated.
        assert_eq!(plan(&starving, 3).create, 1);
        assert_eq!(plan(&starving, 2).create, 0);

        let oversized = PoolCensus {
            base: 4,
            usable: 4,
            idle: vec!["a".into(), "b".into(), "c".into()],
            broken: false,
        };
        assert_eq!(
            plan(&oversized, 1),
            PoolPlan {
                create: 0,
                delete: Some("a".to_string())
            }
        );

        let busy = PoolCensus {
            base: 4,
            usable: 2,
            idle: vec!["a".into(), "b".into()],
            broken: false,
        };
        assert_eq!(plan(&busy, 1), PoolPlan::default());
    }

    #[tokio::test]
    async fn test_bootstrap_creates_replica_pods() {
        let pool = pool();
        let settings = settings(3, 2);
        pool.store.insert_settings(&settings).unwrap();

        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Healthy);
        let pods = pool
            .cluster
            .pods_labelled(TEMPLATE_LABEL, &settings.id.to_string());
        assert_eq!(pods.len(), 3);
        for pod in &pods {
            assert!(pod.name.starts_with(&format!("pool-{}-", settings.id)));
            assert_eq!(pod.occupied(), 0);
        }

        // Starting pods count as usable; nothing more to do.
        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Healthy);
        assert_eq!(pool_size(&pool, &settings.id), 3);
    }

    #[tokio::test]
    async fn test_starvation_doubles_pool() {
        for (replica, full) in [(1u32, 2usize), (2, 3)] {
            let pool = pool();
            let settings = settings(replica, 2);
            pool.store.insert_settings(&settings).unwrap();
            for i in 0..full {
                pool.cluster.add_pod(
                    &format!("full-{}", i),
                    PodPhase::Running,
                    labels(&settings.id, "2"),
                );
            }

            pool.scaler.check(&settings.id).await;
            assert_eq!(pool_size(&pool, &settings.id), 2 * full);
        }
    }

    #[tokio::test]
    async fn test_saturated_pool_below_target_only_fills_up() {
        let pool = pool();
        let settings = settings(3, 2);
        pool.store.insert_settings(&settings).unwrap();
        for i in 0..2 {
            pool.cluster
                .add_pod(&format!("full-{}", i), PodPhase::Running, labels(&settings.id, "2"));
        }

        pool.scaler.check(&settings.id).await;
        assert_eq!(pool_size(&pool, &settings.id), 3);
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 1);
    }

    #[tokio::test]
    async fn test_shrink_removes_one_idle_pod() {
        let pool = pool();
        let settings = settings(1, 2);
        pool.store.insert_settings(&settings).unwrap();
        for i in 0..4 {
            pool.cluster
                .add_pod(&format!("idle-{}", i), PodPhase::Running, labels(&settings.id, "0"));
        }

        pool.scaler.check(&settings.id).await;
        assert_eq!(pool_size(&pool, &settings.id), 3);
        assert_eq!(pool.cluster.calls(Operation::PatchPodLabels), 1);
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 0);

        pool.scaler.check(&settings.id).await;
        assert_eq!(pool_size(&pool, &settings.id), 2);
    }

    #[tokio::test]
    async fn test_broken_pool_is_torn_down() {
        let pool = pool();
        let settings = settings(2, 2);
        pool.store.insert_settings(&settings).unwrap();
        pool.cluster
            .add_pod("ok", PodPhase::Running, labels(&settings.id, "0"));
        pool.cluster
            .add_pod("dead", PodPhase::Failed, labels(&settings.id, "0"));

        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Retired);
        assert!(pool.cluster.pods().is_empty());
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 0);
    }

    #[tokio::test]
    async fn test_missing_settings_retire_pool() {
        let pool = pool();
        let template = Uuid::new_v4();
        pool.cluster
            .add_pod("orphan", PodPhase::Running, labels(&template, "0"));

        assert_eq!(pool.scaler.check(&template).await, PoolOutcome::Retired);
        assert!(pool.cluster.pods().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_settings_retire_pool() {
        let pool = pool();
        let mut settings = settings(1, 2);
        settings.container_config = "not json".to_string();
        pool.store.insert_settings(&settings).unwrap();

        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Retired);
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 0);
    }

    #[tokio::test]
    async fn test_unshareable_settings_retire_pool() {
        let pool = pool();
        let settings = settings(2, 0);
        pool.store.insert_settings(&settings).unwrap();
        pool.cluster
            .add_pod("stale", PodPhase::Running, labels(&settings.id, "0"));

        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Retired);
        assert!(pool.cluster.pods().is_empty());
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 0);
    }

    #[tokio::test]
    async fn test_workspace_failure_keeps_schedule() {
        let pool = pool();
        let settings = settings(2, 2);
        pool.store.insert_settings(&settings).unwrap();
        pool.cluster.fail_next(
            Operation::EnsureNamespace,
            ClusterError::Transient("api unavailable".to_string()),
        );

        assert_eq!(pool.scaler.check(&settings.id).await, PoolOutcome::Healthy);
        assert_eq!(pool.cluster.calls(Operation::CreatePod), 0);

        pool.scaler.check(&settings.id).await;
        assert_eq!(pool_size(&pool, &settings.id), 2);
    }

    #[test]
    fn test_pool_pod_mounts() {
        let settings = settings(1, 2);
        let container = parse_container_config(&settings.container_config).unwrap();
        let config = ControllerConfig::default();
        let pod = pool_pod(&settings, &container, &config);

        assert_eq!(pod.name.len(), format!("pool-{}-", settings.id).len() + 8);
        assert_eq!(pod.image, "ubuntu:22.04");
        assert!(pod.mounts[0].read_only);
        assert_eq!(pod.mounts[1].mount_path, "/mnt/userspace/");
        assert!(!pod.mounts[1].read_only);
    }
}
