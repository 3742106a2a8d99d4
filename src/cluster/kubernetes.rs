//! Kubernetes backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec as KubeJobSpec},
        core::v1::{
            Container, EnvVar, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, Pod as KubePod, PodSpec as KubePodSpec,
            PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
            VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, PropagationPolicy},
};
use tracing::debug;

use super::types::{
    ClaimMount, ClaimSpec, ClusterApi, ClusterError, ClusterResult, JobSpec, Pod, PodPhase,
    PodSpec,
};

const JOB_GRACE_PERIOD_SECONDS: u32 = 5;

pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Connects with the in-cluster service account or the local kubeconfig.
    pub async fn connect(namespace: &str) -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Transient(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: &str) -> Self {
        KubeCluster {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<KubePod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn map_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            409 => ClusterError::AlreadyExists(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            _ => ClusterError::Transient(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        other => ClusterError::Transient(other.to_string()),
    }
}

fn volumes_and_mounts(mounts: &[ClaimMount]) -> (Vec<Volume>, Vec<VolumeMount>) {
    let volumes = mounts
        .iter()
        .map(|mount| Volume {
            name: mount.volume.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: mount.claim_name.clone(),
                read_only: Some(mount.read_only),
            }),
            ..Default::default()
        })
        .collect();
    let volume_mounts = mounts
        .iter()
        .map(|mount| VolumeMount {
            name: mount.volume.clone(),
            mount_path: mount.mount_path.clone(),
            sub_path: mount.sub_path.clone(),
            read_only: Some(mount.read_only),
            ..Default::default()
        })
        .collect();
    (volumes, volume_mounts)
}

pub(crate) fn namespace_manifest(namespace: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "name".to_string(),
                namespace.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn claim_manifest(claim: &ClaimSpec, namespace: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(claim.storage.clone()),
                )])),
                ..Default::default()
            }),
            storage_class_name: claim.storage_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn job_manifest(job: &JobSpec) -> Job {
    let (volumes, volume_mounts) = volumes_and_mounts(&job.mounts);
    let resources = job.memory_limit.as_ref().map(|limit| ResourceRequirements {
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(limit.clone()),
        )])),
        ..Default::default()
    });
    let container = Container {
        name: "task-container".to_string(),
        image: Some(job.image.clone()),
        command: Some(job.command.clone()),
        args: Some(job.args.clone()),
        env: Some(
            job.env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        volume_mounts: Some(volume_mounts),
        resources,
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            ..Default::default()
        },
        spec: Some(KubeJobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(KubePodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            backoff_limit: Some(job.backoff_limit),
            active_deadline_seconds: Some(job.active_deadline_seconds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pod_manifest(pod: &PodSpec) -> KubePod {
    let (volumes, volume_mounts) = volumes_and_mounts(&pod.mounts);
    KubePod {
        metadata: ObjectMeta {
            name: Some(pod.name.clone()),
            labels: Some(pod.labels.clone()),
            ..Default::default()
        },
        spec: Some(KubePodSpec {
            restart_policy: Some("Always".to_string()),
            containers: vec![Container {
                name: "pool-container".to_string(),
                image: Some(pod.image.clone()),
                // Keep an otherwise idle shell image alive.
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn summarize(pod: KubePod) -> Pod {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(PodPhase::parse)
        .unwrap_or(PodPhase::Unknown);
    Pod {
        name: pod.metadata.name.unwrap_or_default(),
        phase,
        labels: pod.metadata.labels.unwrap_or_default(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn ensure_namespace(&self) -> ClusterResult<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces
            .create(&PostParams::default(), &namespace_manifest(&self.namespace))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn ensure_claim(&self, claim: &ClaimSpec) -> ClusterResult<()> {
        self.claims()
            .create(&PostParams::default(), &claim_manifest(claim, &self.namespace))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn claim_exists(&self, name: &str) -> ClusterResult<bool> {
        self.claims()
            .get_opt(name)
            .await
            .map(|claim| claim.is_some())
            .map_err(map_error)
    }

    async fn create_job(&self, job: &JobSpec) -> ClusterResult<()> {
        debug!("Creating job {} in {}", job.name, self.namespace);
        self.jobs()
            .create(&PostParams::default(), &job_manifest(job))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            grace_period_seconds: Some(JOB_GRACE_PERIOD_SECONDS),
            ..Default::default()
        };
        self.jobs()
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn list_pods(&self, label: &str, value: &str) -> ClusterResult<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("{}={}", label, value));
        let pods = self.pods().list(&params).await.map_err(map_error)?;
        Ok(pods.items.into_iter().map(summarize).collect())
    }

    async fn pod_logs(&self, name: &str) -> ClusterResult<String> {
        self.pods()
            .logs(name, &LogParams::default())
            .await
            .map_err(map_error)
    }

    async fn create_pod(&self, pod: &PodSpec) -> ClusterResult<()> {
        self.pods()
            .create(&PostParams::default(), &pod_manifest(pod))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
