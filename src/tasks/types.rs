use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Scheduled,
    Pending,
    Running,
    Succeeded,
    Failed,
    Deleting,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Scheduled => "SCHEDULED",
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Succeeded => "SUCCEEDED",
            State::Failed => "FAILED",
            State::Deleting => "DELETING",
        }
    }

    /// Succeeded and Failed tasks never move again, apart from removal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(State::Scheduled),
            "PENDING" => Ok(State::Pending),
            "RUNNING" => Ok(State::Running),
            "SUCCEEDED" => Ok(State::Succeeded),
            "FAILED" => Ok(State::Failed),
            "DELETING" => Ok(State::Deleting),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// A task template: how to run a class of tasks and how big its warm pool is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub id: Uuid,
    pub owner_id: String,
    /// Raw JSON, checked by [`crate::tasks::config::parse_container_config`].
    pub container_config: String,
    /// Seconds between two pool checks.
    pub ttl_interval: u64,
    pub replica: u32,
    pub max_sharing_users: u32,
    /// Seconds.
    pub time_limit: u64,
}

impl TaskSettings {
    pub fn new(
        owner_id: &str,
        container_config: &str,
        ttl_interval: u64,
        replica: u32,
        max_sharing_users: u32,
        time_limit: u64,
    ) -> Self {
        TaskSettings {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            container_config: container_config.to_string(),
            ttl_interval,
            replica,
            max_sharing_users,
            time_limit,
        }
    }
}

/// One run of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub settings_id: Uuid,
    pub user_id: String,
    pub username: String,
    pub state: State,
    pub create_time: DateTime<Utc>,
    /// Set when the job was accepted by the cluster.
    pub dispatch_time: Option<DateTime<Utc>>,
    pub logs: String,
    pub logs_fetched: bool,
    /// Bumped by the store on every successful update.
    pub version: u64,
}

impl Task {
    pub fn new(settings_id: Uuid, user_id: &str, username: &str) -> Self {
        Task {
            id: Uuid::new_v4(),
            settings_id,
            user_id: user_id.to_string(),
            username: username.to_string(),
            state: State::Scheduled,
            create_time: Utc::now(),
            dispatch_time: None,
            logs: String::new(),
            logs_fetched: false,
            version: 0,
        }
    }

    pub fn job_name(&self) -> String {
        format!("task-exec-{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    pub mount_path: String,
}

/// Validated form of [`TaskSettings::container_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub persistent_volume: PersistentVolume,
    pub working_path: String,
    pub shell: String,
    pub memory_limit: Option<String>,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("container config is not valid JSON: {0}")]
    NotJson(String),
    #[error("container config must be a JSON object")]
    NotObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("ttl interval must be between 1 and 31536000 seconds, got {0}")]
    IntervalOutOfRange(u64),
    #[error("max_sharing_users must be at least 1")]
    NoSharing,
}
