use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use uuid::Uuid;

use super::types::{StoreError, StoreResult, TaskStore};
use crate::tasks::types::{State, Task, TaskSettings};

#[derive(Default)]
struct Tables {
    settings: HashMap<Uuid, TaskSettings>,
    tasks: HashMap<Uuid, Task>,
}

/// Store that lives and dies with the process.
#[derive(Default)]
pub struct MemoryStore {
    db: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.db
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

fn sort_by_creation(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| a.create_time.cmp(&b.create_time).then(a.id.cmp(&b.id)));
}

impl TaskStore for MemoryStore {
    fn insert_settings(&self, settings: &TaskSettings) -> StoreResult<()> {
        let mut db = self.tables()?;
        if db.settings.contains_key(&settings.id) {
            return Err(StoreError::Duplicate(settings.id));
        }
        db.settings.insert(settings.id, settings.clone());
        Ok(())
    }

    fn update_settings(&self, settings: &TaskSettings) -> StoreResult<()> {
        let mut db = self.tables()?;
        match db.settings.get_mut(&settings.id) {
            Some(stored) => {
                *stored = settings.clone();
                Ok(())
            }
            None => Err(StoreError::SettingsNotFound(settings.id)),
        }
    }

    fn get_settings(&self, id: &Uuid) -> StoreResult<Option<TaskSettings>> {
        Ok(self.tables()?.settings.get(id).cloned())
    }

    fn list_settings(&self) -> StoreResult<Vec<TaskSettings>> {
        let mut settings: Vec<_> = self.tables()?.settings.values().cloned().collect();
        settings.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(settings)
    }

    fn delete_settings(&self, id: &Uuid) -> StoreResult<()> {
        self.tables()?
            .settings
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::SettingsNotFound(*id))
    }

    fn insert_task(&self, task: &Task) -> StoreResult<()> {
        let mut db = self.tables()?;
        if db.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        db.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: &Uuid) -> StoreResult<Option<Task>> {
        Ok(self.tables()?.tasks.get(id).cloned())
    }

    fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<_> = self.tables()?.tasks.values().cloned().collect();
        sort_by_creation(&mut tasks);
        Ok(tasks)
    }

    fn tasks_in(&self, states: &[State]) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<_> = self
            .tables()?
            .tasks
            .values()
            .filter(|task| states.contains(&task.state))
            .cloned()
            .collect();
        sort_by_creation(&mut tasks);
        Ok(tasks)
    }

    fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let mut db = self.tables()?;
        let stored = db
            .tasks
            .get_mut(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        if stored.version != task.version {
            return Err(StoreError::Conflict {
                id: task.id,
                expected: task.version,
                found: stored.version,
            });
        }
        *stored = Task {
            version: task.version + 1,
            ..task.clone()
        };
        Ok(stored.clone())
    }

    fn delete_task(&self, id: &Uuid) -> StoreResult<()> {
        self.tables()?
            .tasks
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn task_at(settings_id: Uuid, offset_secs: i64) -> Task {
        let mut task = Task::new(settings_id, "u-1", "alice");
        task.create_time = Utc::now() + Duration::seconds(offset_secs);
        task
    }

    #[test]
    fn test_tasks_in_orders_by_creation_time() {
        let store = MemoryStore::new();
        let settings = Uuid::new_v4();
        let late = task_at(settings, 10);
        let early = task_at(settings, 0);
        let mut running = task_at(settings, 5);
        running.state = State::Running;

        store.insert_task(&late).unwrap();
        store.insert_task(&running).unwrap();
        store.insert_task(&early).unwrap();

        let scheduled = store.tasks_in(&[State::Scheduled]).unwrap();
        assert_eq!(
            scheduled.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );
        assert_eq!(store.list_tasks().unwrap().len(), 3);
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let store = MemoryStore::new();
        let task = Task::new(Uuid::new_v4(), "u-1", "alice");
        store.insert_task(&task).unwrap();

        let mut first = task.clone();
        first.state = State::Pending;
        let stored = store.update_task(&first).unwrap();
        assert_eq!(stored.version, 1);

        let mut stale = task.clone();
        stale.state = State::Deleting;
        assert_eq!(
            store.update_task(&stale),
            Err(StoreError::Conflict {
                id: task.id,
                expected: 0,
                found: 1
            })
        );
        assert_eq!(store.get_task(&task.id).unwrap().unwrap().state, State::Pending);
    }

    #[test]
    fn test_settings_crud() {
        let store = MemoryStore::new();
        let mut settings = TaskSettings::new("owner", "{}", 30, 2, 4, 600);
        store.insert_settings(&settings).unwrap();
        assert_eq!(
            store.insert_settings(&settings),
            Err(StoreError::Duplicate(settings.id))
        );

        settings.replica = 5;
        store.update_settings(&settings).unwrap();
        assert_eq!(store.get_settings(&settings.id).unwrap().unwrap().replica, 5);

        store.delete_settings(&settings.id).unwrap();
        assert!(store.get_settings(&settings.id).unwrap().is_none());
        assert_eq!(
            store.delete_settings(&settings.id),
            Err(StoreError::SettingsNotFound(settings.id))
        );
    }
}
