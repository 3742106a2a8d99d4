use uuid::Uuid;

use crate::tasks::types::{State, Task, TaskSettings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("task settings {0} not found")]
    SettingsNotFound(Uuid),
    #[error("{0} already exists")]
    Duplicate(Uuid),
    #[error("task {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict { id: Uuid, expected: u64, found: u64 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted templates and tasks. Pure data access.
///
/// Task updates are compare-and-swap on [`Task::version`]: a write made from
/// a stale copy fails with [`StoreError::Conflict`] and leaves the record
/// untouched.
pub trait TaskStore: Send + Sync {
    fn insert_settings(&self, settings: &TaskSettings) -> StoreResult<()>;
    fn update_settings(&self, settings: &TaskSettings) -> StoreResult<()>;
    fn get_settings(&self, id: &Uuid) -> StoreResult<Option<TaskSettings>>;
    fn list_settings(&self) -> StoreResult<Vec<TaskSettings>>;
    fn delete_settings(&self, id: &Uuid) -> StoreResult<()>;

    fn insert_task(&self, task: &Task) -> StoreResult<()>;
    fn get_task(&self, id: &Uuid) -> StoreResult<Option<Task>>;
    /// All tasks, oldest first.
    fn list_tasks(&self) -> StoreResult<Vec<Task>>;
    /// Tasks in any of `states`, ordered by creation time then id.
    fn tasks_in(&self, states: &[State]) -> StoreResult<Vec<Task>>;
    /// Returns the stored copy carrying its new version.
    fn update_task(&self, task: &Task) -> StoreResult<Task>;
    fn delete_task(&self, id: &Uuid) -> StoreResult<()>;
}
