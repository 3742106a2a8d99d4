//! Single-host backend over the Docker engine API.
//!
//! Namespaces become bridge networks, claims become named volumes, jobs and
//! pods become containers. Every container carries a namespace label so two
//! controllers can share one engine. Docker cannot relabel a running
//! container, so the pool's "deleted" relabel is skipped here; deletion still
//! goes through.
//!
//! A job container carries its deadline and backoff limit as labels. Listing
//! stops containers that outlived their deadline and keeps a failed container
//! pending while the engine still has restarts left for it.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{
        ContainerSummary, HostConfig, Mount, MountTypeEnum, MountVolumeOptions, RestartPolicy,
        RestartPolicyNameEnum,
    },
    network::{CreateNetworkOptions, InspectNetworkOptions},
    volume::CreateVolumeOptions,
};
use chrono::Utc;
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use super::types::{
    ClaimMount, ClaimSpec, ClusterApi, ClusterError, ClusterResult, JobSpec, Pod, PodPhase,
    PodSpec, ignore_not_found,
};

const NAMESPACE_LABEL: &str = "podpool.namespace";
/// Unix time after which a job container is stopped and reported failed.
const DEADLINE_LABEL: &str = "podpool.deadline";
const BACKOFF_LABEL: &str = "podpool.backoff-limit";
/// Where the sub-path setup container mounts each claim.
const SETUP_ROOT: &str = "/claims";

pub struct DockerCluster {
    client: Docker,
    namespace: String,
}

fn map_error(err: bollard::errors::Error) -> ClusterError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => ClusterError::NotFound(message),
            409 => ClusterError::AlreadyExists(message),
            400 => ClusterError::Invalid(message),
            _ => ClusterError::Transient(format!("{}: {}", status_code, message)),
        },
        other => ClusterError::Transient(other.to_string()),
    }
}

/// Converts a Kubernetes-style memory quantity (`512Mi`, `2G`, `1048576`)
/// into bytes.
pub(crate) fn memory_bytes(limit: &str) -> Option<i64> {
    let limit = limit.trim();
    let split = limit
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(limit.len());
    let (digits, suffix) = limit.split_at(split);
    let value: i64 = digits.parse().ok()?;
    let multiplier: i64 = match suffix {
        "" => 1,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn exit_code(status: Option<&str>) -> Option<i64> {
    status?
        .strip_prefix("Exited (")?
        .split(')')
        .next()?
        .parse()
        .ok()
}

/// Maps a container's state onto the pod lifecycle.
pub(crate) fn phase_of(state: Option<&str>, status: Option<&str>) -> PodPhase {
    match state {
        Some("created") | Some("restarting") => PodPhase::Pending,
        Some("running") | Some("paused") => PodPhase::Running,
        Some("exited") => match exit_code(status) {
            Some(0) => PodPhase::Succeeded,
            Some(_) => PodPhase::Failed,
            None => PodPhase::Unknown,
        },
        _ => PodPhase::Unknown,
    }
}

/// Phase of a job container once its deadline and remaining restarts are
/// taken into account.
pub(crate) fn job_phase(observed: PodPhase, expired: bool, restarts_left: bool) -> PodPhase {
    match observed {
        PodPhase::Succeeded => PodPhase::Succeeded,
        _ if expired => PodPhase::Failed,
        PodPhase::Failed if restarts_left => PodPhase::Pending,
        other => other,
    }
}

fn label_number(labels: &BTreeMap<String, String>, key: &str) -> Option<i64> {
    labels.get(key)?.parse().ok()
}

fn summarize(container: ContainerSummary) -> Pod {
    let phase = phase_of(container.state.as_deref(), container.status.as_deref());
    let name = container
        .names
        .and_then(|names| names.into_iter().next())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();
    Pod {
        name,
        phase,
        labels: container.labels.unwrap_or_default().into_iter().collect(),
    }
}

/// Mounts the claim's volume, narrowed to its sub-path when one is set, so
/// pool pods and jobs share the same files.
fn volume_mount(mount: &ClaimMount) -> Mount {
    Mount {
        target: Some(mount.mount_path.clone()),
        source: Some(mount.claim_name.clone()),
        typ: Some(MountTypeEnum::VOLUME),
        read_only: Some(mount.read_only),
        volume_options: mount.sub_path.as_ref().map(|sub_path| MountVolumeOptions {
            subpath: Some(sub_path.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mounts and `mkdir -p` targets that create every sub-path inside its
/// claim. Docker refuses to mount a sub-path that does not exist yet.
fn sub_path_setup(mounts: &[ClaimMount]) -> Option<(Vec<Mount>, Vec<String>)> {
    let mut claims: Vec<&str> = Vec::new();
    let mut dirs = Vec::new();
    for mount in mounts {
        let Some(sub_path) = &mount.sub_path else {
            continue;
        };
        if !claims.contains(&mount.claim_name.as_str()) {
            claims.push(&mount.claim_name);
        }
        dirs.push(format!(
            "{}/{}/{}",
            SETUP_ROOT,
            mount.claim_name,
            sub_path.trim_matches('/')
        ));
    }
    if dirs.is_empty() {
        return None;
    }
    let mounts = claims
        .into_iter()
        .map(|claim| Mount {
            target: Some(format!("{}/{}", SETUP_ROOT, claim)),
            source: Some(claim.to_string()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(false),
            ..Default::default()
        })
        .collect();
    Some((mounts, dirs))
}

impl DockerCluster {
    pub fn connect(namespace: &str) -> ClusterResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(DockerCluster {
            client,
            namespace: namespace.to_string(),
        })
    }

    fn labels(&self, labels: &BTreeMap<String, String>) -> HashMap<String, String> {
        let mut all: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.insert(NAMESPACE_LABEL.to_string(), self.namespace.clone());
        all
    }

    fn mounts(&self, mounts: &[ClaimMount]) -> Vec<Mount> {
        mounts.iter().map(volume_mount).collect()
    }

    /// Creates the sub-paths `mounts` need with a short-lived container built
    /// from `image`, and waits for it to exit.
    async fn prepare_sub_paths(
        &self,
        name: &str,
        image: &str,
        mounts: &[ClaimMount],
    ) -> ClusterResult<()> {
        let Some((setup_mounts, dirs)) = sub_path_setup(mounts) else {
            return Ok(());
        };
        let setup = format!("{}-setup", name);
        ignore_not_found(self.remove(&setup).await)?;

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(
                ["mkdir".to_string(), "-p".to_string()]
                    .into_iter()
                    .chain(dirs)
                    .collect(),
            ),
            labels: Some(self.labels(&BTreeMap::new())),
            host_config: Some(HostConfig {
                mounts: Some(setup_mounts),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.run_container(&setup, config).await?;

        let mut result = Ok(());
        let mut wait = self
            .client
            .wait_container(&setup, None::<WaitContainerOptions<String>>);
        while let Some(status) = wait.next().await {
            if let Err(e) = status {
                result = Err(map_error(e));
                break;
            }
        }
        if let Err(e) = self.remove(&setup).await {
            debug!("Failed to remove setup container {}: {}", setup, e);
        }
        result
    }

    /// Applies the deadline and backoff labels of a job container to its
    /// observed phase, stopping it once the deadline has passed.
    async fn job_state(&self, mut pod: Pod, now: i64) -> ClusterResult<Pod> {
        let Some(deadline) = label_number(&pod.labels, DEADLINE_LABEL) else {
            return Ok(pod);
        };
        let expired = now >= deadline;
        if expired && matches!(pod.phase, PodPhase::Pending | PodPhase::Running) {
            info!("Job container {} passed its deadline, stopping it", pod.name);
            if let Err(e) = self
                .client
                .stop_container(&pod.name, Some(StopContainerOptions { t: 0 }))
                .await
            {
                warn!("Failed to stop job container {}: {}", pod.name, e);
            }
        }

        let mut restarts_left = false;
        if !expired && pod.phase == PodPhase::Failed {
            let backoff_limit = label_number(&pod.labels, BACKOFF_LABEL).unwrap_or(0);
            match self
                .client
                .inspect_container(&pod.name, None::<InspectContainerOptions>)
                .await
            {
                Ok(details) => {
                    restarts_left = details.restart_count.unwrap_or(0) < backoff_limit;
                }
                Err(e) => match map_error(e) {
                    ClusterError::NotFound(_) => {}
                    other => return Err(other),
                },
            }
        }

        pod.phase = job_phase(pod.phase, expired, restarts_left);
        Ok(pod)
    }

    async fn pull_image(&self, image: &str) -> ClusterResult<()> {
        debug!("Pulling image: {}", image);
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("{}: {}", image, status);
                    }
                }
                Err(e) => {
                    warn!("Error during image pull of {}: {}", image, e);
                    return Err(map_error(e));
                }
            }
        }
        Ok(())
    }

    async fn run_container(&self, name: &str, config: Config<String>) -> ClusterResult<()> {
        let image = config.image.clone().unwrap_or_default();
        self.pull_image(&image).await?;

        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        });
        let created = self
            .client
            .create_container(options, config)
            .await
            .map_err(map_error)?;
        debug!("Container {} created: {}", name, created.id);

        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)?;
        info!("Container {} started", name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> ClusterResult<()> {
        self.client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)
    }
}

#[async_trait]
impl ClusterApi for DockerCluster {
    async fn ensure_namespace(&self) -> ClusterResult<()> {
        match self
            .client
            .inspect_network(&self.namespace, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Err(ClusterError::AlreadyExists(self.namespace.clone())),
            Err(e) => match map_error(e) {
                ClusterError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        self.client
            .create_network(CreateNetworkOptions {
                name: self.namespace.clone(),
                driver: "bridge".to_string(),
                labels: HashMap::from([(NAMESPACE_LABEL.to_string(), self.namespace.clone())]),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn ensure_claim(&self, claim: &ClaimSpec) -> ClusterResult<()> {
        if self.claim_exists(&claim.name).await? {
            return Err(ClusterError::AlreadyExists(claim.name.clone()));
        }
        self.client
            .create_volume(CreateVolumeOptions {
                name: claim.name.clone(),
                driver: "local".to_string(),
                labels: HashMap::from([(NAMESPACE_LABEL.to_string(), self.namespace.clone())]),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn claim_exists(&self, name: &str) -> ClusterResult<bool> {
        match self.client.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => match map_error(e) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_job(&self, job: &JobSpec) -> ClusterResult<()> {
        let memory = match &job.memory_limit {
            Some(limit) => Some(memory_bytes(limit).ok_or_else(|| {
                ClusterError::Invalid(format!("unsupported memory limit: {}", limit))
            })?),
            None => None,
        };

        self.prepare_sub_paths(&job.name, &job.image, &job.mounts)
            .await?;

        let mut labels = self.labels(&job.labels);
        labels.insert(
            DEADLINE_LABEL.to_string(),
            (Utc::now().timestamp() + job.active_deadline_seconds).to_string(),
        );
        labels.insert(BACKOFF_LABEL.to_string(), job.backoff_limit.to_string());

        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(job.backoff_limit as i64),
            }),
            memory,
            mounts: Some(self.mounts(&job.mounts)),
            network_mode: Some(self.namespace.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(job.image.clone()),
            cmd: Some(job.command.iter().chain(job.args.iter()).cloned().collect()),
            env: Some(
                job.env
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect(),
            ),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.run_container(&job.name, config).await
    }

    async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        self.remove(name).await
    }

    async fn list_pods(&self, label: &str, value: &str) -> ClusterResult<Vec<Pod>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}={}", NAMESPACE_LABEL, self.namespace),
                format!("{}={}", label, value),
            ],
        )]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_error)?;

        let now = Utc::now().timestamp();
        let mut pods = Vec::with_capacity(containers.len());
        for container in containers {
            pods.push(self.job_state(summarize(container), now).await?);
        }
        Ok(pods)
    }

    async fn pod_logs(&self, name: &str) -> ClusterResult<String> {
        let mut stream = self.client.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&chunk.map_err(map_error)?.to_string());
        }
        Ok(logs)
    }

    async fn create_pod(&self, pod: &PodSpec) -> ClusterResult<()> {
        self.prepare_sub_paths(&pod.name, &pod.image, &pod.mounts)
            .await?;

        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            mounts: Some(self.mounts(&pod.mounts)),
            network_mode: Some(self.namespace.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(pod.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(self.labels(&pod.labels)),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.run_container(&pod.name, config).await
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        self.client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        debug!(
            "Docker labels are immutable, not relabelling {} with {:?}",
            name, labels
        );
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.remove(name).await
    }
}
