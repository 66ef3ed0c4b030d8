//! Per-session audit records.
//!
//! One record per session-affecting event, success or failure. Records for a
//! single session are strictly ordered by `sequence_no`; the log itself is an
//! append-only JSONL file shared by all sessions of a store.

use crate::core::constraint::Violation;
use crate::core::error::CodewardError;
use crate::core::protocol::ActionKind;
use crate::core::schemas;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditAction {
    pub kind: ActionKind,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub ts: String,
    pub event_id: String,
    pub session_id: String,
    /// Monotonic per session, assigned by the session itself.
    pub sequence_no: u64,
    /// Operation: propose, commit, commit_failed, halt, reset, activate,
    /// suspend, resume, close.
    pub op: String,
    pub action: Option<AuditAction>,
    pub decision: Option<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub snapshot_before: Option<String>,
    pub snapshot_after: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(root: &Path) -> Self {
        Self { path: root.join(schemas::AUDIT_EVENTS_NAME) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), CodewardError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(CodewardError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(record).unwrap())
            .map_err(CodewardError::IoError)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>, CodewardError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|e| CodewardError::ValidationError(format!("corrupt audit line: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records for one session, in commit-sequence order.
    pub fn read_session(&self, session_id: &str) -> Result<Vec<AuditRecord>, CodewardError> {
        let mut records: Vec<AuditRecord> = self
            .read_all()?
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect();
        records.sort_by_key(|r| r.sequence_no);
        Ok(records)
    }
}

/// Builder used by the session; keeps record construction in one place.
pub fn record(
    session_id: &str,
    sequence_no: u64,
    op: &str,
) -> AuditRecord {
    AuditRecord {
        ts: time::now_epoch_z(),
        event_id: time::new_event_id(),
        session_id: session_id.to_string(),
        sequence_no,
        op: op.to_string(),
        action: None,
        decision: None,
        violations: Vec::new(),
        snapshot_before: None,
        snapshot_after: None,
        detail: None,
    }
}
