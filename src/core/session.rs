//! The `ProtocolSession` state machine.
//!
//! One session owns one agent interaction: the compiled policy, the action
//! counters, the violation log, the emergency-stop controller, and the audit
//! sequence. Sessions are operated by a single logical caller; the `&mut`
//! receiver is the serialization point; cross-thread callers wrap the session
//! in a mutex.
//!
//! Lifecycle: `Initializing -> Active -> {Suspended, Halted, Closed}`.
//! `Active <-> Suspended` is reversible. `Halted` is terminal except through
//! [`ProtocolSession::reset_from_halted`], which consumes the halted session
//! and produces a fresh one inheriting its snapshot lineage. `Closed` is
//! terminal.

use crate::core::audit::{self, AuditAction, AuditLog};
use crate::core::constraint::{ChangeCounters, ConstraintValidator, Severity, Violation};
use crate::core::emergency::{EmergencyStopConfig, EmergencyStopController, StopEventKind};
use crate::core::error::CodewardError;
use crate::core::protocol::{Action, ActionKind, ProtocolDeclaration, SessionPolicy};
use crate::core::schemas;
use crate::core::snapshot::SnapshotStore;
use crate::core::store::Store;
use crate::core::time;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Active,
    Suspended,
    Halted,
    Closed,
}

/// Outcome of a proposed action. Denials are reported results, not errors.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "decision", content = "reason")]
pub enum Decision {
    Allow,
    AllowWithReview,
    Deny(String),
    Halted,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow | Decision::AllowWithReview)
    }

    pub fn label(&self) -> String {
        match self {
            Decision::Allow => "allow".to_string(),
            Decision::AllowWithReview => "allow_with_review".to_string(),
            Decision::Deny(reason) => format!("deny:{}", reason),
            Decision::Halted => "halted".to_string(),
        }
    }
}

/// Validation evidence presented at commit time, produced inline by the
/// session's own validator or by a completed orchestrator task.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidationOutcome {
    pub source: String,
    pub violations: Vec<Violation>,
}

impl ValidationOutcome {
    pub fn inline(violations: Vec<Violation>) -> Self {
        Self { source: "inline".to_string(), violations }
    }

    pub fn clean() -> Self {
        Self::inline(Vec::new())
    }

    pub fn from_task(task_id: &str, violations: Vec<Violation>) -> Self {
        Self { source: format!("task:{}", task_id), violations }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub sequence_no: u64,
    pub snapshot_before: String,
    pub snapshot_after: String,
}

#[derive(Debug)]
pub struct ProtocolSession {
    id: String,
    state: SessionState,
    policy: SessionPolicy,
    validator: ConstraintValidator,
    stop: EmergencyStopController,
    snapshots: SnapshotStore,
    audit: AuditLog,
    seq: u64,
    session_changes: u32,
    file_changes: FxHashMap<String, u32>,
    violation_log: Vec<Violation>,
    /// ALLOW* decisions awaiting commit, keyed by action fingerprint. Each
    /// approval is consumed by exactly one commit.
    approvals: FxHashMap<String, Decision>,
    last_good_snapshot: Option<String>,
    halt_reason: Option<String>,
    reset_of: Option<String>,
}

impl ProtocolSession {
    /// Creates a session from a protocol declaration, failing fast on a
    /// malformed declaration or constraint set.
    pub fn create(
        store: &Store,
        workspace_root: &Path,
        declaration: &ProtocolDeclaration,
        stop_config: EmergencyStopConfig,
    ) -> Result<Self, CodewardError> {
        let policy = declaration.compile(workspace_root)?;
        let validator = ConstraintValidator::new(policy.constraints.clone());
        let snapshots = SnapshotStore::open(store.snapshots_dir())?;
        let stop = EmergencyStopController::new(stop_config)
            .with_events_log(store.events_path(schemas::EMERGENCY_EVENTS_NAME));
        let audit = AuditLog::new(&store.root);

        let mut session = Self {
            id: time::new_event_id(),
            state: SessionState::Initializing,
            policy,
            validator,
            stop,
            snapshots,
            audit,
            seq: 0,
            session_changes: 0,
            file_changes: FxHashMap::default(),
            violation_log: Vec::new(),
            approvals: FxHashMap::default(),
            last_good_snapshot: None,
            halt_reason: None,
            reset_of: None,
        };
        let detail = format!(
            "safety_level={:?} access_scope={:?}",
            session.policy.safety_level, session.policy.access_scope
        );
        session.audit_lifecycle("create", Some(detail))?;
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn violation_log(&self) -> &[Violation] {
        &self.violation_log
    }

    pub fn last_good_snapshot(&self) -> Option<&str> {
        self.last_good_snapshot.as_deref()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    /// The session this one was reset from, if any.
    pub fn reset_of(&self) -> Option<&str> {
        self.reset_of.as_deref()
    }

    pub fn stop_controller(&self) -> &EmergencyStopController {
        &self.stop
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn activate(&mut self) -> Result<(), CodewardError> {
        if self.state != SessionState::Initializing {
            return Err(CodewardError::ValidationError(format!(
                "activate is only valid from initializing, session is {:?}",
                self.state
            )));
        }
        self.state = SessionState::Active;
        self.audit_lifecycle("activate", None)
    }

    pub fn suspend(&mut self) -> Result<(), CodewardError> {
        if self.state != SessionState::Active {
            return Err(CodewardError::StaleSession(self.id.clone()));
        }
        self.state = SessionState::Suspended;
        self.audit_lifecycle("suspend", None)
    }

    pub fn resume(&mut self) -> Result<(), CodewardError> {
        if self.state != SessionState::Suspended {
            return Err(CodewardError::ValidationError(format!(
                "resume is only valid from suspended, session is {:?}",
                self.state
            )));
        }
        self.state = SessionState::Active;
        self.audit_lifecycle("resume", None)
    }

    /// Explicit end of session. A halted session cannot be closed, only
    /// reset.
    pub fn close(&mut self) -> Result<(), CodewardError> {
        match self.state {
            SessionState::Closed => Ok(()),
            SessionState::Halted => Err(CodewardError::ValidationError(
                "halted sessions require reset_from_halted, not close".to_string(),
            )),
            _ => {
                self.state = SessionState::Closed;
                self.audit_lifecycle("close", None)
            }
        }
    }

    /// Checks a proposed action against the safety level, the access scope,
    /// the session counters, and the constraint set. Counters advance only on
    /// ALLOW*. Never mutates the workspace.
    pub fn propose_action(&mut self, action: &Action) -> Result<Decision, CodewardError> {
        match self.state {
            SessionState::Halted => {
                self.audit_decision("propose", action, &Decision::Halted, &[])?;
                return Ok(Decision::Halted);
            }
            SessionState::Active => {}
            _ => return Err(CodewardError::StaleSession(self.id.clone())),
        }
        if self.stop.is_tripped() {
            let reason = self
                .stop
                .trip_reason()
                .unwrap_or("emergency_stop")
                .to_string();
            self.enter_halt(&reason)?;
            self.audit_decision("propose", action, &Decision::Halted, &[])?;
            return Ok(Decision::Halted);
        }

        let (decision, violations) = self.decide(action);
        self.violation_log.extend(violations.iter().cloned());

        match &decision {
            Decision::Allow | Decision::AllowWithReview => {
                if let Some(reason) = self.stop.record_event(StopEventKind::Change) {
                    // The event that would have granted this action tripped
                    // the controller; the grant is withdrawn.
                    self.enter_halt(&reason)?;
                    self.audit_decision("propose", action, &Decision::Halted, &violations)?;
                    return Ok(Decision::Halted);
                }
                if action.kind.is_mutation() {
                    self.session_changes += 1;
                    *self
                        .file_changes
                        .entry(action.rel_path().to_string())
                        .or_insert(0) += 1;
                }
                self.approvals.insert(fingerprint(action), decision.clone());
            }
            Decision::Deny(_) => {
                if let Some(reason) = self.stop.record_event(StopEventKind::Error) {
                    self.audit_decision("propose", action, &decision, &violations)?;
                    self.enter_halt(&reason)?;
                    return Ok(decision);
                }
            }
            Decision::Halted => {}
        }
        self.audit_decision("propose", action, &decision, &violations)?;
        Ok(decision)
    }

    /// Applies a previously allowed action: captures a pre-action snapshot,
    /// mutates the workspace, captures the post-action snapshot, and appends
    /// the audit record linking all three.
    pub fn commit_action(
        &mut self,
        action: &Action,
        outcome: &ValidationOutcome,
    ) -> Result<CommitReceipt, CodewardError> {
        if self.state != SessionState::Active {
            return Err(CodewardError::StaleSession(self.id.clone()));
        }
        let fp = fingerprint(action);
        if self.approvals.remove(&fp).is_none() {
            self.audit_failure("commit_failed", action, "commit_without_prior_allow")?;
            self.record_outcome(StopEventKind::Error)?;
            return Err(CodewardError::ValidationError(
                "commit requires a prior allow decision for this exact action".to_string(),
            ));
        }
        if let Some(severity) = ConstraintValidator::worst_severity(&outcome.violations) {
            if severity >= Severity::HIGH {
                self.violation_log.extend(outcome.violations.iter().cloned());
                self.audit_failure("commit_failed", action, "validation_failed")?;
                self.record_outcome(StopEventKind::Error)?;
                return Err(CodewardError::ValidationError(format!(
                    "validation result from {} carries denying violations",
                    outcome.source
                )));
            }
        }

        let workspace = self.policy.workspace_root.clone();
        let before = match self
            .snapshots
            .capture(&workspace, self.last_good_snapshot.as_deref())
        {
            Ok(manifest) => manifest,
            Err(e) => {
                self.audit_failure("commit_failed", action, &e.to_string())?;
                self.record_outcome(StopEventKind::Error)?;
                return Err(e);
            }
        };

        if let Err(e) = self.apply(action) {
            self.audit_failure("commit_failed", action, &e.to_string())?;
            self.record_outcome(StopEventKind::Error)?;
            return Err(e);
        }

        let after = match self.snapshots.capture(&workspace, Some(before.id.as_str())) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.audit_failure("commit_failed", action, &e.to_string())?;
                self.record_outcome(StopEventKind::Error)?;
                return Err(e);
            }
        };
        self.last_good_snapshot = Some(after.id.clone());

        let sequence_no = self.next_seq();
        let mut record = audit::record(&self.id, sequence_no, "commit");
        record.action = Some(AuditAction {
            kind: action.kind,
            path: action.rel_path().to_string(),
        });
        record.decision = Some("committed".to_string());
        record.violations = outcome.violations.clone();
        record.snapshot_before = Some(before.id.clone());
        record.snapshot_after = Some(after.id.clone());
        record.detail = Some(outcome.source.clone());
        self.audit.append(&record)?;

        self.record_outcome(StopEventKind::Change)?;

        Ok(CommitReceipt {
            sequence_no,
            snapshot_before: before.id,
            snapshot_after: after.id,
        })
    }

    /// Forces the session into `Halted`. Idempotent.
    pub fn halt(&mut self, reason: &str) -> Result<(), CodewardError> {
        self.stop.trip_manual(reason);
        self.enter_halt(reason)
    }

    /// Feeds an externally observed outcome (e.g. a failed orchestrator
    /// task) into the emergency-stop window.
    pub fn record_external_event(&mut self, kind: StopEventKind) -> Result<(), CodewardError> {
        if self.state == SessionState::Active {
            self.record_outcome(kind)?;
        }
        Ok(())
    }

    /// Consumes a halted session and produces a new active one inheriting
    /// the snapshot lineage. Requires the stop controller's authorized reset.
    pub fn reset_from_halted(
        mut self,
        actor: &str,
        token: &str,
    ) -> Result<ProtocolSession, CodewardError> {
        if self.state != SessionState::Halted {
            return Err(CodewardError::ValidationError(
                "reset_from_halted is only valid for a halted session".to_string(),
            ));
        }
        self.stop.reset(actor, token)?;

        let old_id = self.id.clone();
        let mut next = ProtocolSession {
            id: time::new_event_id(),
            state: SessionState::Active,
            policy: self.policy,
            validator: self.validator,
            stop: self.stop,
            snapshots: self.snapshots,
            audit: self.audit,
            seq: 0,
            session_changes: 0,
            file_changes: FxHashMap::default(),
            violation_log: Vec::new(),
            approvals: FxHashMap::default(),
            last_good_snapshot: self.last_good_snapshot,
            halt_reason: None,
            reset_of: Some(old_id.clone()),
        };
        next.audit_lifecycle("reset", Some(format!("reset_of={} actor={}", old_id, actor)))?;
        Ok(next)
    }

    fn decide(&self, action: &Action) -> (Decision, Vec<Violation>) {
        if !self.policy.permits(action.kind) {
            let reason = if action.kind == ActionKind::Suggest {
                "safety_level_forbids_suggestion"
            } else {
                "safety_level_forbids_mutation"
            };
            return (Decision::Deny(reason.to_string()), Vec::new());
        }
        if !self.policy.contains(action.rel_path()) {
            return (
                Decision::Deny("path_outside_access_scope".to_string()),
                Vec::new(),
            );
        }

        let counters = ChangeCounters {
            session_changes: self.session_changes,
            file_changes: *self.file_changes.get(action.rel_path()).unwrap_or(&0),
        };
        let violations = self.validator.evaluate(action, counters);
        let decision = match ConstraintValidator::worst_severity(&violations) {
            Some(Severity::CRITICAL) | Some(Severity::HIGH) => {
                let worst = violations
                    .iter()
                    .max_by_key(|v| v.severity)
                    .expect("non-empty violations");
                Decision::Deny(worst.reason.clone())
            }
            Some(Severity::MEDIUM) => Decision::AllowWithReview,
            Some(Severity::LOW) | None => Decision::Allow,
        };
        let decision = match decision {
            Decision::Allow if action.kind.is_mutation() && self.policy.require_human_review => {
                Decision::AllowWithReview
            }
            other => other,
        };
        (decision, violations)
    }

    fn apply(&self, action: &Action) -> Result<(), CodewardError> {
        let dest = self.policy.workspace_root.join(action.rel_path());
        match action.kind {
            ActionKind::Modify | ActionKind::Create => {
                let content = action.content.as_deref().ok_or_else(|| {
                    CodewardError::ValidationError("mutation carries no content".to_string())
                })?;
                if let Some(dir) = dest.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::write(&dest, content)?;
            }
            ActionKind::Delete => {
                if dest.exists() {
                    fs::remove_file(&dest)?;
                }
            }
            ActionKind::Read | ActionKind::Suggest => {}
        }
        Ok(())
    }

    fn record_outcome(&mut self, kind: StopEventKind) -> Result<(), CodewardError> {
        if let Some(reason) = self.stop.record_event(kind) {
            self.enter_halt(&reason)?;
        }
        Ok(())
    }

    fn enter_halt(&mut self, reason: &str) -> Result<(), CodewardError> {
        if self.state == SessionState::Halted {
            return Ok(());
        }
        self.state = SessionState::Halted;
        self.halt_reason = Some(reason.to_string());

        let mut detail = reason.to_string();
        if self.stop.auto_rollback() {
            if let Some(snapshot_id) = self.last_good_snapshot.clone() {
                match self.snapshots.restore(&snapshot_id, &self.policy.workspace_root) {
                    Ok(_) => detail.push_str(&format!("; rolled_back_to={}", snapshot_id)),
                    Err(e) => detail.push_str(&format!("; rollback_failed={}", e)),
                }
            }
        }

        let sequence_no = self.next_seq();
        let mut record = audit::record(&self.id, sequence_no, "halt");
        record.detail = Some(detail);
        self.audit.append(&record)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn audit_lifecycle(&mut self, op: &str, detail: Option<String>) -> Result<(), CodewardError> {
        let sequence_no = self.next_seq();
        let mut record = audit::record(&self.id, sequence_no, op);
        record.detail = detail;
        self.audit.append(&record)
    }

    fn audit_decision(
        &mut self,
        op: &str,
        action: &Action,
        decision: &Decision,
        violations: &[Violation],
    ) -> Result<(), CodewardError> {
        let sequence_no = self.next_seq();
        let mut record = audit::record(&self.id, sequence_no, op);
        record.action = Some(AuditAction {
            kind: action.kind,
            path: action.rel_path().to_string(),
        });
        record.decision = Some(decision.label());
        record.violations = violations.to_vec();
        self.audit.append(&record)
    }

    fn audit_failure(
        &mut self,
        op: &str,
        action: &Action,
        detail: &str,
    ) -> Result<(), CodewardError> {
        let sequence_no = self.next_seq();
        let mut record = audit::record(&self.id, sequence_no, op);
        record.action = Some(AuditAction {
            kind: action.kind,
            path: action.rel_path().to_string(),
        });
        record.detail = Some(detail.to_string());
        self.audit.append(&record)
    }
}

/// Stable identity of an action for the propose/commit handshake.
fn fingerprint(action: &Action) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}", action.kind));
    hasher.update([0u8]);
    hasher.update(action.rel_path());
    hasher.update([0u8]);
    if let Some(content) = &action.content {
        hasher.update(content);
    }
    if let Some(diff) = &action.diff {
        hasher.update(diff);
    }
    format!("{:x}", hasher.finalize())
}
