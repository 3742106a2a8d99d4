use std::{sync::Arc, time::Duration};

use serde_json::json;

use podpool::{
    cluster::{
        MemoryCluster, PodPhase,
        memory::job_pod_name,
        types::{TASK_LABEL, TEMPLATE_LABEL},
    },
    config::{Backend, ControllerConfig},
    manager::Manager,
    store::{MemoryStore, SqliteStore, TaskStore},
    tasks::types::{State, TaskSettings},
};

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        backend: Backend::Memory,
        idle_backoff_ms: 5,
        tick_ms: 5,
        ..ControllerConfig::default()
    }
}

fn template(replica: u32) -> TaskSettings {
    let config = json!({
        "image": "python:3.11",
        "persistent_volume": { "name": "course-data", "mount_path": "/mnt/course" },
        "working_path": "/home/work",
        "shell": "/bin/sh",
        "memory_limit": "",
        "commands": ["python grade.py"]
    });
    TaskSettings::new("instructor", &config.to_string(), 1, replica, 3, 600)
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn run_lifecycle(store: Arc<dyn TaskStore>) {
    let cluster = Arc::new(MemoryCluster::new());
    let manager = Manager::new(fast_config(), store.clone(), cluster.clone());

    let settings = manager.create_settings(template(2)).unwrap();
    manager.start().await.unwrap();

    let label = settings.id.to_string();
    eventually("pool bootstrap", || {
        cluster.pods_labelled(TEMPLATE_LABEL, &label).len() == 2
    })
    .await;

    let task = manager.submit_task(&settings.id, "12", "bob").unwrap();
    eventually("dispatch", || {
        manager.get_task(&task.id).unwrap().state == State::Pending
    })
    .await;

    let job = cluster.job(&task.job_name()).unwrap();
    assert_eq!(job.memory_limit, None);
    assert_eq!(job.labels.get(TASK_LABEL), Some(&task.id.to_string()));

    let pod = job_pod_name(&task.job_name());
    cluster.set_phase(&pod, PodPhase::Running);
    eventually("running", || {
        manager.get_task(&task.id).unwrap().state == State::Running
    })
    .await;

    cluster.set_logs(&pod, "score: 100\n");
    cluster.set_phase(&pod, PodPhase::Succeeded);
    eventually("success", || {
        manager.get_task(&task.id).unwrap().state == State::Succeeded
    })
    .await;
    let finished = manager.get_task(&task.id).unwrap();
    assert_eq!(finished.logs, "score: 100\n");
    assert!(finished.logs_fetched);
    eventually("job cleanup", || cluster.job(&task.job_name()).is_none()).await;
    assert_eq!(cluster.log_reads(&pod), 1);

    manager.request_deletion(&task.id).unwrap();
    eventually("reap", || store.get_task(&task.id).unwrap().is_none()).await;

    manager.delete_settings(&settings.id).await.unwrap();
    assert!(cluster.pods_labelled(TEMPLATE_LABEL, &label).is_empty());
    assert!(manager.scheduler.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_lifecycle_with_memory_store() {
    run_lifecycle(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_lifecycle_with_sqlite_store() {
    run_lifecycle(Arc::new(SqliteStore::in_memory().unwrap())).await;
}

#[tokio::test]
async fn test_start_registers_stored_templates() {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let valid = template(1);
    let mut invalid = template(1);
    invalid.container_config = "{}".to_string();
    store.insert_settings(&valid).unwrap();
    store.insert_settings(&invalid).unwrap();

    let manager = Manager::new(fast_config(), store, cluster);
    manager.start().await.unwrap();
    manager.start().await.unwrap();

    assert_eq!(manager.scheduler.scheduled_ids(), vec![valid.id]);
    manager.stop().await;
}
