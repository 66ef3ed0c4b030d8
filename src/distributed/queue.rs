//! Durable, priority-ordered validation task queue.
//!
//! Backed by `queue.db` behind the broker thin waist. Tasks are dequeued in
//! `(priority DESC, enqueue_seq ASC)` order: a stable priority queue with
//! FIFO tie-break. A claim attaches an exclusive, time-bounded lease; lease
//! expiry is the only signal of worker death. A task reaches exactly one
//! terminal status; retries are fresh task rows linked through `retry_of`.

use crate::core::broker::DbBroker;
use crate::core::constraint::Violation;
use crate::core::error::CodewardError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use ulid::Ulid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "timed_out" => Some(TaskStatus::TimedOut),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Submission shape: everything the queue needs to mint a task row.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub target_ref: String,
    pub validator_kind: String,
    pub priority: i64,
    pub payload: JsonValue,
}

impl TaskSpec {
    pub fn new(target_ref: &str, validator_kind: &str, priority: i64, payload: JsonValue) -> Self {
        Self {
            target_ref: target_ref.to_string(),
            validator_kind: validator_kind.to_string(),
            priority,
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidationTask {
    pub task_id: String,
    pub target_ref: String,
    pub validator_kind: String,
    pub priority: i64,
    pub payload: JsonValue,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub retry_of: Option<String>,
    pub cancel_requested: bool,
    pub lease_id: Option<String>,
    pub lease_expiry: Option<u64>,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result wire shape reported back through the queue.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub execution_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct QueueStats {
    pub depth: u64,
    pub in_flight: u64,
    pub oldest_age_secs: Option<u64>,
}

/// Outcome of reclaiming one expired lease. `new_task_id` is `None` when the
/// retry budget was exhausted and the task went terminally failed.
#[derive(Debug, Clone)]
pub struct ReclaimedTask {
    pub expired_task_id: String,
    pub new_task_id: Option<String>,
    pub retry_count: u32,
}

pub struct TaskQueue {
    root: PathBuf,
    broker: DbBroker,
}

pub fn queue_db_path(root: &Path) -> PathBuf {
    root.join(schemas::QUEUE_DB_NAME)
}

impl TaskQueue {
    pub fn open(store: &Store) -> Result<Self, CodewardError> {
        std::fs::create_dir_all(&store.root)?;
        let queue = Self {
            root: store.root.clone(),
            broker: DbBroker::new(&store.root),
        };
        queue
            .broker
            .with_conn(&queue.db_path(), "codeward", None, "queue.init", |conn| {
                conn.execute(schemas::QUEUE_DB_SCHEMA_TASKS, [])?;
                conn.execute(schemas::QUEUE_DB_SCHEMA_INDEX_STATUS, [])?;
                conn.execute(schemas::QUEUE_DB_SCHEMA_INDEX_CLAIM, [])?;
                conn.execute(schemas::QUEUE_DB_SCHEMA_INDEX_LEASE, [])?;
                conn.execute(schemas::QUEUE_DB_SCHEMA_INDEX_RETRY_OF, [])?;
                Ok(())
            })?;
        Ok(queue)
    }

    pub fn db_path(&self) -> PathBuf {
        queue_db_path(&self.root)
    }

    pub fn enqueue(&self, spec: &TaskSpec) -> Result<String, CodewardError> {
        let task_id = Ulid::new().to_string();
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.enqueue", |conn| {
                insert_task(conn, &task_id, spec, 0, None)
            })?;
        Ok(task_id)
    }

    /// Claims the highest-priority, oldest pending task for `worker_id`,
    /// attaching an exclusive lease. The claim runs in an immediate
    /// transaction so at most one worker wins a given task.
    pub fn claim_next(
        &self,
        worker_id: &str,
        lease_secs: u64,
    ) -> Result<Option<ValidationTask>, CodewardError> {
        let worker = worker_id.to_string();
        self.broker
            .with_conn(&self.db_path(), &worker, None, "queue.claim", |conn| {
                in_immediate_tx(conn, |conn| {
                    let candidate: Option<String> = conn
                        .query_row(
                            "SELECT task_id FROM tasks WHERE status = 'pending'
                             ORDER BY priority DESC, enqueue_seq ASC LIMIT 1",
                            [],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let Some(task_id) = candidate else {
                        return Ok(None);
                    };

                    let lease_id = Ulid::new().to_string();
                    let lease_expiry = time::now_epoch_secs() + lease_secs;
                    let updated = conn.execute(
                        "UPDATE tasks SET status = 'running', lease_id = ?1,
                         lease_expiry = ?2, worker_id = ?3, updated_at = ?4
                         WHERE task_id = ?5 AND status = 'pending'",
                        params![lease_id, lease_expiry as i64, worker, time::now_epoch_z(), task_id],
                    )?;
                    if updated != 1 {
                        return Ok(None);
                    }
                    Ok(Some(read_task(conn, &task_id)?))
                })
            })
    }

    /// Extends a held lease. Returns false when the lease is no longer held
    /// (expired and reclaimed, or the task reached a terminal state).
    pub fn renew_lease(
        &self,
        task_id: &str,
        lease_id: &str,
        lease_secs: u64,
    ) -> Result<bool, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.renew", |conn| {
                let expiry = time::now_epoch_secs() + lease_secs;
                let updated = conn.execute(
                    "UPDATE tasks SET lease_expiry = ?1, updated_at = ?2
                     WHERE task_id = ?3 AND lease_id = ?4 AND status = 'running'",
                    params![expiry as i64, time::now_epoch_z(), task_id, lease_id],
                )?;
                Ok(updated == 1)
            })
    }

    /// Terminal transition to `completed`, gated on the lease still being
    /// held.
    pub fn complete(
        &self,
        task_id: &str,
        lease_id: &str,
        result: &TaskResult,
    ) -> Result<bool, CodewardError> {
        self.finish(task_id, lease_id, TaskStatus::Completed, Some(result), None)
    }

    /// Terminal transition to `failed` with error detail.
    pub fn fail(
        &self,
        task_id: &str,
        lease_id: &str,
        error: &str,
    ) -> Result<bool, CodewardError> {
        self.finish(task_id, lease_id, TaskStatus::Failed, None, Some(error))
    }

    /// Terminal transition to `cancelled`, reported by a worker that
    /// observed the cancel flag mid-processing.
    pub fn cancel_observed(&self, task_id: &str, lease_id: &str) -> Result<bool, CodewardError> {
        self.finish(task_id, lease_id, TaskStatus::Cancelled, None, Some("cancel_requested"))
    }

    fn finish(
        &self,
        task_id: &str,
        lease_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<bool, CodewardError> {
        let result_json = match result {
            Some(r) => Some(
                serde_json::to_string(r)
                    .map_err(|e| CodewardError::ValidationError(e.to_string()))?,
            ),
            None => None,
        };
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.finish", |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = ?1, result = ?2, error = ?3,
                     lease_id = NULL, lease_expiry = NULL, updated_at = ?4
                     WHERE task_id = ?5 AND lease_id = ?6 AND status = 'running'",
                    params![
                        status.as_str(),
                        result_json,
                        error,
                        time::now_epoch_z(),
                        task_id,
                        lease_id
                    ],
                )?;
                Ok(updated == 1)
            })
    }

    /// Marks a task for cancellation. Advisory: a worker that already
    /// finished ignores it; a pending task is cancelled outright.
    pub fn request_cancel(&self, task_id: &str) -> Result<bool, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.cancel", |conn| {
                let now = time::now_epoch_z();
                let cancelled_pending = conn.execute(
                    "UPDATE tasks SET status = 'cancelled', error = 'cancel_requested',
                     cancel_requested = 1, updated_at = ?1
                     WHERE task_id = ?2 AND status = 'pending'",
                    params![now, task_id],
                )?;
                if cancelled_pending == 1 {
                    return Ok(true);
                }
                let flagged = conn.execute(
                    "UPDATE tasks SET cancel_requested = 1, updated_at = ?1
                     WHERE task_id = ?2 AND status = 'running'",
                    params![now, task_id],
                )?;
                Ok(flagged == 1)
            })
    }

    pub fn get(&self, task_id: &str) -> Result<ValidationTask, CodewardError> {
        let id = task_id.to_string();
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.get", |conn| {
                let exists: Option<String> = conn
                    .query_row(
                        "SELECT task_id FROM tasks WHERE task_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(CodewardError::NotFound(format!("task {}", id)));
                }
                read_task(conn, &id)
            })
    }

    /// The terminal result of a task, if it has one yet. Non-terminal tasks
    /// yield `None`.
    pub fn result(&self, task_id: &str) -> Result<Option<TaskResult>, CodewardError> {
        let task = self.get(task_id)?;
        if !task.status.is_terminal() {
            return Ok(None);
        }
        if let Some(raw) = self.read_result_json(task_id)? {
            let parsed: TaskResult = serde_json::from_str(&raw)
                .map_err(|e| CodewardError::ValidationError(format!("corrupt result: {}", e)))?;
            return Ok(Some(parsed));
        }
        Ok(Some(TaskResult {
            task_id: task.task_id,
            status: task.status,
            violations: Vec::new(),
            error: self.read_error(task_id)?,
            worker_id: task.worker_id,
            execution_ms: None,
        }))
    }

    fn read_result_json(&self, task_id: &str) -> Result<Option<String>, CodewardError> {
        let id = task_id.to_string();
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.result", |conn| {
                let raw: Option<Option<String>> = conn
                    .query_row(
                        "SELECT result FROM tasks WHERE task_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw.flatten())
            })
    }

    fn read_error(&self, task_id: &str) -> Result<Option<String>, CodewardError> {
        let id = task_id.to_string();
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.error", |conn| {
                let raw: Option<Option<String>> = conn
                    .query_row(
                        "SELECT error FROM tasks WHERE task_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw.flatten())
            })
    }

    /// The task that superseded `task_id` after a lease expiry, if any.
    pub fn successor_of(&self, task_id: &str) -> Result<Option<String>, CodewardError> {
        let id = task_id.to_string();
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.successor", |conn| {
                let next: Option<String> = conn
                    .query_row(
                        "SELECT task_id FROM tasks WHERE retry_of = ?1
                         ORDER BY enqueue_seq ASC LIMIT 1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(next)
            })
    }

    pub fn depth(&self) -> Result<u64, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.depth", |conn| {
                let depth: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(depth as u64)
            })
    }

    pub fn stats(&self) -> Result<QueueStats, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.stats", |conn| {
                let depth: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )?;
                let in_flight: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
                    [],
                    |row| row.get(0),
                )?;
                let oldest: Option<String> = conn
                    .query_row(
                        "SELECT created_at FROM tasks WHERE status = 'pending'
                         ORDER BY enqueue_seq ASC LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                let oldest_age_secs = oldest
                    .and_then(|ts| time::epoch_secs_of(&ts))
                    .map(|created| time::now_epoch_secs().saturating_sub(created));
                Ok(QueueStats {
                    depth: depth as u64,
                    in_flight: in_flight as u64,
                    oldest_age_secs,
                })
            })
    }

    /// Drops terminal task rows last touched before `before_epoch`. Results
    /// are retained until consumed or TTL expiry; this is the expiry half.
    pub fn purge_terminal(&self, before_epoch: u64) -> Result<u64, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.purge", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, updated_at FROM tasks
                     WHERE status IN ('completed', 'failed', 'timed_out', 'cancelled')",
                )?;
                let rows: Vec<(String, String)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut purged = 0u64;
                for (task_id, updated_at) in rows {
                    let updated = time::epoch_secs_of(&updated_at).unwrap_or(u64::MAX);
                    if updated < before_epoch {
                        conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
                        purged += 1;
                    }
                }
                Ok(purged)
            })
    }

    /// Reclaims every running task whose lease has expired. The expired row
    /// is closed as `timed_out` (a terminal status is never reopened) and,
    /// while the retry budget lasts, a fresh task row is enqueued with
    /// `retry_of` lineage and an incremented retry counter. Past the budget
    /// the expired row is closed as `failed` instead.
    pub fn reclaim_expired(&self, max_retries: u32) -> Result<Vec<ReclaimedTask>, CodewardError> {
        self.broker
            .with_conn(&self.db_path(), "codeward", None, "queue.reclaim", |conn| {
                in_immediate_tx(conn, |conn| {
                    let now = time::now_epoch_secs();
                    let mut stmt = conn.prepare(
                        "SELECT task_id FROM tasks
                         WHERE status = 'running' AND lease_expiry IS NOT NULL AND lease_expiry < ?1",
                    )?;
                    let expired: Vec<String> = stmt
                        .query_map(params![now as i64], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    drop(stmt);

                    let mut reclaimed = Vec::new();
                    for task_id in expired {
                        let task = read_task(conn, &task_id)?;
                        let next_retry = task.retry_count + 1;
                        if next_retry > max_retries {
                            conn.execute(
                                "UPDATE tasks SET status = 'failed', error = 'max_retries_exceeded',
                                 lease_id = NULL, lease_expiry = NULL, updated_at = ?1
                                 WHERE task_id = ?2",
                                params![time::now_epoch_z(), task_id],
                            )?;
                            reclaimed.push(ReclaimedTask {
                                expired_task_id: task_id,
                                new_task_id: None,
                                retry_count: task.retry_count,
                            });
                            continue;
                        }

                        conn.execute(
                            "UPDATE tasks SET status = 'timed_out', error = 'lease_expired',
                             lease_id = NULL, lease_expiry = NULL, updated_at = ?1
                             WHERE task_id = ?2",
                            params![time::now_epoch_z(), task_id],
                        )?;
                        let new_id = Ulid::new().to_string();
                        let spec = TaskSpec {
                            target_ref: task.target_ref.clone(),
                            validator_kind: task.validator_kind.clone(),
                            priority: task.priority,
                            payload: task.payload.clone(),
                        };
                        insert_task(conn, &new_id, &spec, next_retry, Some(task_id.as_str()))?;
                        reclaimed.push(ReclaimedTask {
                            expired_task_id: task_id,
                            new_task_id: Some(new_id),
                            retry_count: next_retry,
                        });
                    }
                    Ok(reclaimed)
                })
            })
    }
}

fn insert_task(
    conn: &Connection,
    task_id: &str,
    spec: &TaskSpec,
    retry_count: u32,
    retry_of: Option<&str>,
) -> Result<(), CodewardError> {
    let now = time::now_epoch_z();
    let payload = serde_json::to_string(&spec.payload)
        .map_err(|e| CodewardError::ValidationError(e.to_string()))?;
    conn.execute(
        "INSERT INTO tasks(task_id, target_ref, validator_kind, priority, payload,
         status, retry_count, retry_of, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
        params![
            task_id,
            spec.target_ref,
            spec.validator_kind,
            spec.priority,
            payload,
            retry_count,
            retry_of,
            now
        ],
    )?;
    Ok(())
}

fn read_task(conn: &Connection, task_id: &str) -> Result<ValidationTask, CodewardError> {
    let task = conn.query_row(
        "SELECT task_id, target_ref, validator_kind, priority, payload, status,
         retry_count, retry_of, cancel_requested, lease_id, lease_expiry,
         worker_id, created_at, updated_at
         FROM tasks WHERE task_id = ?1",
        params![task_id],
        row_to_task,
    )?;
    Ok(task)
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ValidationTask> {
    let payload_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let lease_expiry: Option<i64> = row.get(10)?;
    Ok(ValidationTask {
        task_id: row.get(0)?,
        target_ref: row.get(1)?,
        validator_kind: row.get(2)?,
        priority: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(JsonValue::Null),
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Failed),
        retry_count: row.get::<_, i64>(6)? as u32,
        retry_of: row.get(7)?,
        cancel_requested: row.get::<_, i64>(8)? != 0,
        lease_id: row.get(9)?,
        lease_expiry: lease_expiry.map(|v| v as u64),
        worker_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Runs `f` inside an immediate transaction, rolling back on error.
fn in_immediate_tx<R>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<R, CodewardError>,
) -> Result<R, CodewardError> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT;")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}
