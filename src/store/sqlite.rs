use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use super::types::{StoreError, StoreResult, TaskStore};
use crate::tasks::types::{State, Task, TaskSettings};

const TASK_COLUMNS: &str = "id, settings_id, user_id, username, state, create_time, \
                            dispatch_time, logs, logs_fetched, version";
const SETTINGS_COLUMNS: &str =
    "id, owner_id, container_config, ttl_interval, replica, max_sharing_users, time_limit";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;
        info!("Opened task database at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_settings (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                container_config TEXT NOT NULL,
                ttl_interval INTEGER NOT NULL,
                replica INTEGER NOT NULL,
                max_sharing_users INTEGER NOT NULL,
                time_limit INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                settings_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                username TEXT NOT NULL,
                state TEXT NOT NULL,
                create_time TEXT NOT NULL,
                dispatch_time TEXT,
                logs TEXT NOT NULL DEFAULT '',
                logs_fetched INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state
                ON tasks(state, create_time);
            "#,
        )
        .map_err(backend)?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn unsigned<T: TryFrom<i64>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn integer(value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("{} does not fit an INTEGER column", value)))
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_time(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<TaskSettings> {
    Ok(TaskSettings {
        id: parse_uuid(row, 0)?,
        owner_id: row.get(1)?,
        container_config: row.get(2)?,
        ttl_interval: unsigned(row, 3)?,
        replica: unsigned(row, 4)?,
        max_sharing_users: unsigned(row, 5)?,
        time_limit: unsigned(row, 6)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let state: String = row.get(4)?;
    let create_time: String = row.get(5)?;
    let dispatch_time: Option<String> = row.get(6)?;
    Ok(Task {
        id: parse_uuid(row, 0)?,
        settings_id: parse_uuid(row, 1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        state: state.parse().map_err(|e: String| {
            conversion_error(4, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?,
        create_time: parse_time(&create_time, 5)?,
        dispatch_time: dispatch_time.as_deref().map(|t| parse_time(t, 6)).transpose()?,
        logs: row.get(7)?,
        logs_fetched: row.get(8)?,
        version: unsigned(row, 9)?,
    })
}

impl TaskStore for SqliteStore {
    fn insert_settings(&self, settings: &TaskSettings) -> StoreResult<()> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO task_settings ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    SETTINGS_COLUMNS
                ),
                params![
                    settings.id.to_string(),
                    settings.owner_id,
                    settings.container_config,
                    integer(settings.ttl_interval)?,
                    i64::from(settings.replica),
                    i64::from(settings.max_sharing_users),
                    integer(settings.time_limit)?,
                ],
            )
            .map_err(backend)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(settings.id));
        }
        Ok(())
    }

    fn update_settings(&self, settings: &TaskSettings) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE task_settings SET owner_id = ?2, container_config = ?3, ttl_interval = ?4,
                 replica = ?5, max_sharing_users = ?6, time_limit = ?7 WHERE id = ?1",
                params![
                    settings.id.to_string(),
                    settings.owner_id,
                    settings.container_config,
                    integer(settings.ttl_interval)?,
                    i64::from(settings.replica),
                    i64::from(settings.max_sharing_users),
                    integer(settings.time_limit)?,
                ],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::SettingsNotFound(settings.id));
        }
        Ok(())
    }

    fn get_settings(&self, id: &Uuid) -> StoreResult<Option<TaskSettings>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM task_settings WHERE id = ?1", SETTINGS_COLUMNS),
            params![id.to_string()],
            settings_from_row,
        )
        .optional()
        .map_err(backend)
    }

    fn list_settings(&self) -> StoreResult<Vec<TaskSettings>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM task_settings ORDER BY id",
                SETTINGS_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt.query_map([], settings_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    fn delete_settings(&self, id: &Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM task_settings WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StoreError::SettingsNotFound(*id));
        }
        Ok(())
    }

    fn insert_task(&self, task: &Task) -> StoreResult<()> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    TASK_COLUMNS
                ),
                params![
                    task.id.to_string(),
                    task.settings_id.to_string(),
                    task.user_id,
                    task.username,
                    task.state.as_str(),
                    timestamp(&task.create_time),
                    task.dispatch_time.as_ref().map(timestamp),
                    task.logs,
                    task.logs_fetched,
                    integer(task.version)?,
                ],
            )
            .map_err(backend)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(task.id));
        }
        Ok(())
    }

    fn get_task(&self, id: &Uuid) -> StoreResult<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id.to_string()],
            task_from_row,
        )
        .optional()
        .map_err(backend)
    }

    fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks ORDER BY create_time, id",
                TASK_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt.query_map([], task_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    fn tasks_in(&self, states: &[State]) -> StoreResult<Vec<Task>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=states.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE state IN ({}) ORDER BY create_time, id",
                TASK_COLUMNS, placeholders
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(states.iter().map(State::as_str)),
                task_from_row,
            )
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE tasks SET settings_id = ?3, user_id = ?4, username = ?5, state = ?6,
                 create_time = ?7, dispatch_time = ?8, logs = ?9, logs_fetched = ?10,
                 version = version + 1
                 WHERE id = ?1 AND version = ?2",
                params![
                    task.id.to_string(),
                    integer(task.version)?,
                    task.settings_id.to_string(),
                    task.user_id,
                    task.username,
                    task.state.as_str(),
                    timestamp(&task.create_time),
                    task.dispatch_time.as_ref().map(timestamp),
                    task.logs,
                    task.logs_fetched,
                ],
            )
            .map_err(backend)?;

        if updated == 0 {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT version FROM tasks WHERE id = ?1",
                    params![task.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            return Err(match found {
                Some(found) => StoreError::Conflict {
                    id: task.id,
                    expected: task.version,
                    found: u64::try_from(found).unwrap_or_default(),
                },
                None => StoreError::TaskNotFound(task.id),
            });
        }

        Ok(Task {
            version: task.version + 1,
            ..task.clone()
        })
    }

    fn delete_task(&self, id: &Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StoreError::TaskNotFound(*id));
        }
        Ok(())
    }
}
