pub mod docker;
pub mod kubernetes;
pub mod memory;
pub mod types;

pub use docker::DockerCluster;
pub use kubernetes::KubeCluster;
pub use memory::MemoryCluster;
pub use types::{
    ClaimMount, ClaimSpec, ClusterApi, ClusterError, ClusterResult, JobSpec, Pod, PodPhase,
    PodSpec,
};
