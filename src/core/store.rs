//! Durable task store.
//!
//! Tasks are rows in a single SQLite table ordered by `exec_time`. The
//! dispatcher only ever touches the table through the five primitives of
//! `TaskStore`; `claim_ready` is the one serialization point between
//! dispatcher processes sharing a database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

use crate::domain::{NewTask, TaskId, TaskRecord, EXEC_TIME_CLAIMED};

/// Errors raised by task store primitives
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Task store lock poisoned")]
    LockPoisoned,
}

/// Persistent priority queue of task records
pub trait TaskStore: Send + Sync {
    /// Insert a new record with `exec_time = sched_time`
    fn submit(&self, task: NewTask) -> Result<TaskId, TaskStoreError>;

    /// Atomically claim the ready record with the smallest `exec_time`
    /// in `(0, cutoff_time]`, returning its values before the claim
    fn claim_ready(&self, cutoff_time: i64) -> Result<Option<TaskRecord>, TaskStoreError>;

    /// Re-arm a record in place
    fn stage(
        &self,
        id: TaskId,
        new_exec_time: i64,
        new_stage: i32,
        new_event_id: Option<&str>,
    ) -> Result<(), TaskStoreError>;

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError>;

    /// Records with `exec_time` in `[lo, hi]`, ordered by (exec_time, id)
    fn range_query(
        &self,
        exec_time_lo: i64,
        exec_time_hi: i64,
        event_id: Option<&str>,
    ) -> Result<Vec<TaskRecord>, TaskStoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    exec_time   INTEGER NOT NULL,
    event_id    TEXT    NOT NULL,
    sched_time  INTEGER NOT NULL,
    submit_time INTEGER NOT NULL,
    submit_id   TEXT    NOT NULL,
    opcode      INTEGER NOT NULL,
    stage       INTEGER NOT NULL,
    details     TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_exec_time ON tasks (exec_time, id);
CREATE INDEX IF NOT EXISTS idx_tasks_event ON tasks (event_id, exec_time);
";

const COLUMNS: &str =
    "id, exec_time, event_id, sched_time, submit_time, submit_id, opcode, stage, details";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed task store
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) a store at `path`
    pub fn open(path: &Path) -> Result<Self, TaskStoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets readers proceed while another process holds the write lock
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened task store");
        Self::init(conn)
    }

    /// Private in-memory store, for tests and dry runs
    pub fn in_memory() -> Result<Self, TaskStoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, TaskStoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TaskStoreError> {
        self.conn.lock().map_err(|_| TaskStoreError::LockPoisoned)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: TaskId::new(row.get(0)?),
        exec_time: row.get(1)?,
        event_id: row.get(2)?,
        sched_time: row.get(3)?,
        submit_time: row.get(4)?,
        submit_id: row.get(5)?,
        opcode: row.get(6)?,
        stage: row.get(7)?,
        details: row.get(8)?,
    })
}

fn validate(task: &NewTask) -> Result<(), TaskStoreError> {
    if task.sched_time <= 0 {
        return Err(TaskStoreError::InvalidArgument(format!(
            "sched_time must be positive, got {}",
            task.sched_time
        )));
    }
    if task.submit_time <= 0 {
        return Err(TaskStoreError::InvalidArgument(format!(
            "submit_time must be positive, got {}",
            task.submit_time
        )));
    }
    if task.submit_id.is_empty() {
        return Err(TaskStoreError::InvalidArgument(
            "submit_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl TaskStore for SqliteTaskStore {
    fn submit(&self, task: NewTask) -> Result<TaskId, TaskStoreError> {
        validate(&task)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (exec_time, event_id, sched_time, submit_time, submit_id, opcode, stage, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.sched_time,
                task.event_id,
                task.sched_time,
                task.submit_time,
                task.submit_id,
                task.opcode,
                task.stage,
                task.details,
            ],
        )?;

        Ok(TaskId::new(conn.last_insert_rowid()))
    }

    fn claim_ready(&self, cutoff_time: i64) -> Result<Option<TaskRecord>, TaskStoreError> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so a second process
        // cannot select the same row between our SELECT and UPDATE.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {} FROM tasks
                     WHERE exec_time > ?1 AND exec_time <= ?2
                     ORDER BY exec_time, id LIMIT 1",
                    COLUMNS
                ),
                params![EXEC_TIME_CLAIMED, cutoff_time],
                map_row,
            )
            .optional()?;

        let Some(record) = candidate else {
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE tasks SET exec_time = ?1 WHERE id = ?2 AND exec_time = ?3",
            params![EXEC_TIME_CLAIMED, record.id.get(), record.exec_time],
        )?;
        tx.commit()?;

        Ok((updated == 1).then_some(record))
    }

    fn stage(
        &self,
        id: TaskId,
        new_exec_time: i64,
        new_stage: i32,
        new_event_id: Option<&str>,
    ) -> Result<(), TaskStoreError> {
        if new_exec_time <= 0 {
            return Err(TaskStoreError::InvalidArgument(format!(
                "exec_time must be positive, got {}",
                new_exec_time
            )));
        }

        let conn = self.lock()?;
        let updated = match new_event_id {
            Some(event_id) => conn.execute(
                "UPDATE tasks SET exec_time = ?1, stage = ?2, event_id = ?3 WHERE id = ?4",
                params![new_exec_time, new_stage, event_id, id.get()],
            )?,
            None => conn.execute(
                "UPDATE tasks SET exec_time = ?1, stage = ?2 WHERE id = ?3",
                params![new_exec_time, new_stage, id.get()],
            )?,
        };

        if updated == 0 {
            return Err(TaskStoreError::InvalidArgument(format!("{} does not exist", id)));
        }
        Ok(())
    }

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.get()])?;

        if deleted == 0 {
            return Err(TaskStoreError::InvalidArgument(format!("{} does not exist", id)));
        }
        Ok(())
    }

    fn range_query(
        &self,
        exec_time_lo: i64,
        exec_time_hi: i64,
        event_id: Option<&str>,
    ) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let conn = self.lock()?;

        let records = match event_id {
            Some(event_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks
                     WHERE exec_time >= ?1 AND exec_time <= ?2 AND event_id = ?3
                     ORDER BY exec_time, id",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![exec_time_lo, exec_time_hi, event_id], map_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks
                     WHERE exec_time >= ?1 AND exec_time <= ?2
                     ORDER BY exec_time, id",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![exec_time_lo, exec_time_hi], map_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(records)
    }
}
