use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodewardError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid protocol declaration: {0}")]
    InvalidProtocol(String),
    #[error("Constraint configuration error: {0}")]
    ConstraintConfig(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Snapshot integrity error: {0}")]
    Integrity(String),
    #[error("Session {0} is not active")]
    StaleSession(String),
    #[error("Validation queue is full: depth {depth} at bound {bound}")]
    QueueFull { depth: u64, bound: u64 },
    #[error("Lock wait timed out for {0}")]
    LockTimeout(String),
    #[error("Timed out waiting for task {0}")]
    TimeoutExceeded(String),
    #[error("Task {task_id} exceeded max retries ({retries})")]
    MaxRetriesExceeded { task_id: String, retries: u32 },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
