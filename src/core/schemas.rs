//! Centralized database schema definitions and event-log names.
//!
//! Codeward keeps one SQLite database (the validation queue) plus three
//! append-only JSONL event logs per store:
//! 1. queue.db: durable validation tasks with lease state and retry lineage.
//! 2. broker.events.jsonl: one event per state-mutating DB operation.
//! 3. audit.events.jsonl: ordered per-session audit records.
//! 4. emergency.events.jsonl: emergency-stop trips and resets.

pub const QUEUE_DB_NAME: &str = "queue.db";

pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";
pub const AUDIT_EVENTS_NAME: &str = "audit.events.jsonl";
pub const EMERGENCY_EVENTS_NAME: &str = "emergency.events.jsonl";

/// Task rows are append-ordered by `enqueue_seq`; dequeue order is
/// `(priority DESC, enqueue_seq ASC)` which gives the stable FIFO tie-break.
pub const QUEUE_DB_SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        enqueue_seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL UNIQUE,
        target_ref TEXT NOT NULL,
        validator_kind TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_of TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        lease_id TEXT,
        lease_expiry INTEGER,
        worker_id TEXT,
        result TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const QUEUE_DB_SCHEMA_INDEX_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)";
pub const QUEUE_DB_SCHEMA_INDEX_CLAIM: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority DESC, enqueue_seq ASC)";
pub const QUEUE_DB_SCHEMA_INDEX_LEASE: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks(status, lease_expiry)";
pub const QUEUE_DB_SCHEMA_INDEX_RETRY_OF: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_retry_of ON tasks(retry_of)";
