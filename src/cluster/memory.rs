use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use tracing::debug;

use super::types::{
    ClaimSpec, ClusterApi, ClusterError, ClusterResult, JobSpec, Pod, PodPhase, PodSpec,
};

/// Cluster calls, as recorded by [`MemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureNamespace,
    EnsureClaim,
    ClaimExists,
    CreateJob,
    DeleteJob,
    ListPods,
    PodLogs,
    CreatePod,
    PatchPodLabels,
    DeletePod,
}

#[derive(Debug, Clone)]
struct MemoryPod {
    phase: PodPhase,
    labels: BTreeMap<String, String>,
    logs: String,
    job: Option<String>,
}

#[derive(Default)]
struct ClusterState {
    namespace_ready: bool,
    claims: BTreeSet<String>,
    jobs: BTreeMap<String, JobSpec>,
    submitted: Vec<String>,
    pods: BTreeMap<String, MemoryPod>,
    failures: HashMap<Operation, VecDeque<ClusterError>>,
    calls: HashMap<Operation, usize>,
    log_reads: HashMap<String, usize>,
}

/// A cluster that lives in process memory.
///
/// Jobs get one pod each, named `<job>-pod`, created in the `Pending` phase.
/// Nothing ever runs: phases only change through [`MemoryCluster::set_phase`].
/// Used for dry runs and by the tests, which can also queue failures per
/// operation with [`MemoryCluster::fail_next`].
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the call and pops the next queued failure for it, if any.
    fn enter(&self, op: Operation) -> ClusterResult<MutexGuard<'_, ClusterState>> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!("Injected failure for {:?}: {}", op, err);
            return Err(err);
        }
        Ok(state)
    }

    pub fn fail_next(&self, op: Operation, err: ClusterError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn log_reads(&self, pod: &str) -> usize {
        self.state().log_reads.get(pod).copied().unwrap_or(0)
    }

    /// Adds a pod that no job owns, as if someone else created it.
    pub fn add_pod(&self, name: &str, phase: PodPhase, labels: BTreeMap<String, String>) {
        self.state().pods.insert(
            name.to_string(),
            MemoryPod {
                phase,
                labels,
                logs: String::new(),
                job: None,
            },
        );
    }

    pub fn remove_pod(&self, name: &str) -> bool {
        self.state().pods.remove(name).is_some()
    }

    pub fn set_phase(&self, pod: &str, phase: PodPhase) -> bool {
        match self.state().pods.get_mut(pod) {
            Some(pod) => {
                pod.phase = phase;
                true
            }
            None => false,
        }
    }

    pub fn set_logs(&self, pod: &str, logs: &str) -> bool {
        match self.state().pods.get_mut(pod) {
            Some(pod) => {
                pod.logs = logs.to_string();
                true
            }
            None => false,
        }
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state()
            .pods
            .iter()
            .map(|(name, pod)| to_pod(name, pod))
            .collect()
    }

    pub fn pods_labelled(&self, label: &str, value: &str) -> Vec<Pod> {
        self.pods()
            .into_iter()
            .filter(|pod| pod.labels.get(label).map(String::as_str) == Some(value))
            .collect()
    }

    pub fn job(&self, name: &str) -> Option<JobSpec> {
        self.state().jobs.get(name).cloned()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    /// Every job ever accepted, in submission order.
    pub fn submitted_jobs(&self) -> Vec<String> {
        self.state().submitted.clone()
    }

    pub fn has_claim(&self, name: &str) -> bool {
        self.state().claims.contains(name)
    }
}

fn to_pod(name: &str, pod: &MemoryPod) -> Pod {
    Pod {
        name: name.to_string(),
        phase: pod.phase,
        labels: pod.labels.clone(),
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn ensure_namespace(&self) -> ClusterResult<()> {
        let mut state = self.enter(Operation::EnsureNamespace)?;
        if state.namespace_ready {
            return Err(ClusterError::AlreadyExists("namespace".to_string()));
        }
        state.namespace_ready = true;
        Ok(())
    }

    async fn ensure_claim(&self, claim: &ClaimSpec) -> ClusterResult<()> {
        let mut state = self.enter(Operation::EnsureClaim)?;
        if !state.claims.insert(claim.name.clone()) {
            return Err(ClusterError::AlreadyExists(claim.name.clone()));
        }
        Ok(())
    }

    async fn claim_exists(&self, name: &str) -> ClusterResult<bool> {
        let state = self.enter(Operation::ClaimExists)?;
        Ok(state.claims.contains(name))
    }

    async fn create_job(&self, job: &JobSpec) -> ClusterResult<()> {
        let mut state = self.enter(Operation::CreateJob)?;
        if !state.namespace_ready {
            return Err(ClusterError::NotFound("namespace".to_string()));
        }
        if state.jobs.contains_key(&job.name) {
            return Err(ClusterError::AlreadyExists(job.name.clone()));
        }
        state.jobs.insert(job.name.clone(), job.clone());
        state.submitted.push(job.name.clone());
        state.pods.insert(
            job_pod_name(&job.name),
            MemoryPod {
                phase: PodPhase::Pending,
                labels: job.labels.clone(),
                logs: String::new(),
                job: Some(job.name.clone()),
            },
        );
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.enter(Operation::DeleteJob)?;
        if state.jobs.remove(name).is_none() {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        state.pods.retain(|_, pod| pod.job.as_deref() != Some(name));
        Ok(())
    }

    async fn list_pods(&self, label: &str, value: &str) -> ClusterResult<Vec<Pod>> {
        let state = self.enter(Operation::ListPods)?;
        Ok(state
            .pods
            .iter()
            .filter(|(_, pod)| pod.labels.get(label).map(String::as_str) == Some(value))
            .map(|(name, pod)| to_pod(name, pod))
            .collect())
    }

    async fn pod_logs(&self, name: &str) -> ClusterResult<String> {
        let mut state = self.enter(Operation::PodLogs)?;
        let logs = state
            .pods
            .get(name)
            .map(|pod| pod.logs.clone())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        *state.log_reads.entry(name.to_string()).or_default() += 1;
        Ok(logs)
    }

    async fn create_pod(&self, pod: &PodSpec) -> ClusterResult<()> {
        let mut state = self.enter(Operation::CreatePod)?;
        if !state.namespace_ready {
            return Err(ClusterError::NotFound("namespace".to_string()));
        }
        if state.pods.contains_key(&pod.name) {
            return Err(ClusterError::AlreadyExists(pod.name.clone()));
        }
        state.pods.insert(
            pod.name.clone(),
            MemoryPod {
                phase: PodPhase::Pending,
                labels: pod.labels.clone(),
                logs: String::new(),
                job: None,
            },
        );
        Ok(())
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut state = self.enter(Operation::PatchPodLabels)?;
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        pod.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.enter(Operation::DeletePod)?;
        state
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }
}

/// Name of the pod [`MemoryCluster`] creates for a job.
pub fn job_pod_name(job: &str) -> String {
    format!("{}-pod", job)
}
