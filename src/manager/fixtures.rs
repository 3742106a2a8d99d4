use std::sync::Arc;

use serde_json::json;

use super::types::Manager;
use crate::{
    cluster::MemoryCluster,
    config::{Backend, ControllerConfig},
    store::MemoryStore,
    tasks::types::TaskSettings,
};

pub(crate) struct Fixture {
    pub manager: Manager,
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<MemoryCluster>,
}

pub(crate) fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let config = ControllerConfig {
        backend: Backend::Memory,
        idle_backoff_ms: 10,
        tick_ms: 10,
        pod_startup_grace: 30,
        ..ControllerConfig::default()
    };
    let manager = Manager::new(config, store.clone(), cluster.clone());
    Fixture {
        manager,
        store,
        cluster,
    }
}

pub(crate) fn container_config() -> String {
    json!({
        "image": "python:3.11",
        "persistent_volume": { "name": "shared-data", "mount_path": "/mnt/shared" },
        "working_path": "/workspace",
        "shell": "/bin/bash",
        "memory_limit": "512Mi",
        "commands": ["cd /workspace", "python main.py"]
    })
    .to_string()
}

pub(crate) fn settings(replica: u32, max_sharing_users: u32) -> TaskSettings {
    TaskSettings::new("owner", &container_config(), 60, replica, max_sharing_users, 3600)
}
