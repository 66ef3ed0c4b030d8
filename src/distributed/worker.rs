//! Validation workers and the closed validator registry.
//!
//! Validator kinds are a closed, tagged set known at compile time; adding a
//! kind means adding a registry entry, not loading code at runtime. Execution
//! reuses the same pure constraint evaluation the session runs inline, so a
//! task validates identically whether it ran locally or on a worker.

use crate::core::constraint::{
    ChangeCounters, Constraint, ConstraintRule, ConstraintValidator, Severity, Violation,
    compile_pattern,
};
use crate::core::error::CodewardError;
use crate::core::protocol::{Action, CustomRuleDecl, RuleMode};
use crate::core::store::Store;
use crate::distributed::queue::{TaskQueue, TaskResult, TaskStatus, ValidationTask};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidatorKind {
    /// Full constraint-set evaluation over a proposed change.
    ConstraintScan,
    /// One-off pattern check without a full constraint block.
    PatternScan,
    /// Size and line-length bounds over raw content.
    FileMetrics,
}

impl ValidatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidatorKind::ConstraintScan => "constraint_scan",
            ValidatorKind::PatternScan => "pattern_scan",
            ValidatorKind::FileMetrics => "file_metrics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constraint_scan" => Some(ValidatorKind::ConstraintScan),
            "pattern_scan" => Some(ValidatorKind::PatternScan),
            "file_metrics" => Some(ValidatorKind::FileMetrics),
            _ => None,
        }
    }
}

pub type ValidatorFn = fn(&ValidationTask) -> Result<Vec<Violation>, CodewardError>;

/// Explicit mapping kind -> implementation. New kinds require a registry
/// entry.
pub struct ValidatorRegistry {
    validators: FxHashMap<ValidatorKind, ValidatorFn>,
}

impl ValidatorRegistry {
    pub fn empty() -> Self {
        Self { validators: FxHashMap::default() }
    }

    /// The built-in closed set.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ValidatorKind::ConstraintScan, run_constraint_scan);
        registry.register(ValidatorKind::PatternScan, run_pattern_scan);
        registry.register(ValidatorKind::FileMetrics, run_file_metrics);
        registry
    }

    pub fn register(&mut self, kind: ValidatorKind, f: ValidatorFn) {
        self.validators.insert(kind, f);
    }

    pub fn get(&self, kind: ValidatorKind) -> Option<ValidatorFn> {
        self.validators.get(&kind).copied()
    }
}

/// Payload for `constraint_scan`: the proposed change plus the declared
/// rules, mirroring what a session evaluates inline.
#[derive(Debug, Deserialize)]
struct ConstraintScanPayload {
    action: Action,
    #[serde(default)]
    rules: Vec<CustomRuleDecl>,
    max_file_size: Option<u64>,
    #[serde(default)]
    counters: ChangeCounters,
    max_changes_per_session: Option<u32>,
}

fn run_constraint_scan(task: &ValidationTask) -> Result<Vec<Violation>, CodewardError> {
    let payload: ConstraintScanPayload = serde_json::from_value(task.payload.clone())
        .map_err(|e| CodewardError::ValidationError(format!("bad payload: {}", e)))?;

    let mut constraints = Vec::new();
    if let Some(limit) = payload.max_file_size {
        constraints.push(Constraint {
            name: "max_file_size".to_string(),
            severity: Severity::HIGH,
            rule: ConstraintRule::MaxFileSize(limit),
        });
    }
    if let Some(limit) = payload.max_changes_per_session {
        constraints.push(Constraint {
            name: "max_changes_per_session".to_string(),
            severity: Severity::HIGH,
            rule: ConstraintRule::MaxChangesPerSession(limit),
        });
    }
    for rule in &payload.rules {
        let re = compile_pattern(&rule.name, &rule.pattern)?;
        constraints.push(Constraint {
            name: rule.name.clone(),
            severity: rule.severity,
            rule: match rule.mode {
                RuleMode::Required => ConstraintRule::PatternRequired(re),
                RuleMode::Forbidden => ConstraintRule::PatternForbidden(re),
            },
        });
    }

    let validator = ConstraintValidator::new(constraints);
    Ok(validator.evaluate(&payload.action, payload.counters))
}

#[derive(Debug, Deserialize)]
struct PatternScanPayload {
    content: String,
    pattern: String,
    mode: RuleMode,
    #[serde(default = "default_scan_severity")]
    severity: Severity,
    name: Option<String>,
}

fn default_scan_severity() -> Severity {
    Severity::HIGH
}

fn run_pattern_scan(task: &ValidationTask) -> Result<Vec<Violation>, CodewardError> {
    let payload: PatternScanPayload = serde_json::from_value(task.payload.clone())
        .map_err(|e| CodewardError::ValidationError(format!("bad payload: {}", e)))?;
    let name = payload.name.unwrap_or_else(|| "pattern_scan".to_string());
    let re = compile_pattern(&name, &payload.pattern)?;

    let constraint = Constraint {
        name,
        severity: payload.severity,
        rule: match payload.mode {
            RuleMode::Required => ConstraintRule::PatternRequired(re),
            RuleMode::Forbidden => ConstraintRule::PatternForbidden(re),
        },
    };
    let validator = ConstraintValidator::new(vec![constraint]);
    let action = Action::modify(&task.target_ref, &payload.content);
    Ok(validator.evaluate(&action, ChangeCounters::default()))
}

#[derive(Debug, Deserialize)]
struct FileMetricsPayload {
    content: String,
    max_file_size: Option<u64>,
    max_line_length: Option<usize>,
}

fn run_file_metrics(task: &ValidationTask) -> Result<Vec<Violation>, CodewardError> {
    let payload: FileMetricsPayload = serde_json::from_value(task.payload.clone())
        .map_err(|e| CodewardError::ValidationError(format!("bad payload: {}", e)))?;
    let mut violations = Vec::new();

    if let Some(limit) = payload.max_file_size {
        let size = payload.content.len() as u64;
        if size > limit {
            violations.push(Violation {
                constraint: "max_file_size".to_string(),
                severity: Severity::HIGH,
                location: task.target_ref.clone(),
                reason: "max_file_size_exceeded".to_string(),
                message: format!("content is {} bytes, limit is {}", size, limit),
            });
        }
    }
    if let Some(limit) = payload.max_line_length {
        for (idx, line) in payload.content.lines().enumerate() {
            if line.len() > limit {
                violations.push(Violation {
                    constraint: "max_line_length".to_string(),
                    severity: Severity::MEDIUM,
                    location: format!("{}:{}", task.target_ref, idx + 1),
                    reason: "max_line_length_exceeded".to_string(),
                    message: format!("line is {} chars, limit is {}", line.len(), limit),
                });
                break;
            }
        }
    }
    Ok(violations)
}

/// Pulls tasks, executes registered validators, and reports results. One
/// worker processes one task at a time under an exclusive lease; renewal is
/// the worker's responsibility while it processes.
pub struct ValidationWorker {
    worker_id: String,
    queue: TaskQueue,
    registry: ValidatorRegistry,
    lease_secs: u64,
    report_attempts: u32,
}

impl ValidationWorker {
    pub fn new(
        store: &Store,
        worker_id: &str,
        registry: ValidatorRegistry,
    ) -> Result<Self, CodewardError> {
        Ok(Self {
            worker_id: worker_id.to_string(),
            queue: TaskQueue::open(store)?,
            registry,
            lease_secs: 30,
            report_attempts: 3,
        })
    }

    pub fn with_lease_secs(mut self, lease_secs: u64) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims and processes at most one task. Returns the reported result,
    /// or `None` when the queue had nothing pending.
    pub fn run_once(&self) -> Result<Option<TaskResult>, CodewardError> {
        let Some(task) = self.queue.claim_next(&self.worker_id, self.lease_secs)? else {
            return Ok(None);
        };
        let lease_id = task.lease_id.clone().unwrap_or_default();
        let started = Instant::now();

        // Cancellation is advisory: honor a flag raised before or during the
        // claim, otherwise proceed.
        let current = self.queue.get(&task.task_id)?;
        if current.cancel_requested {
            self.report(|| self.queue.cancel_observed(&task.task_id, &lease_id))?;
            return Ok(Some(TaskResult {
                task_id: task.task_id.clone(),
                status: TaskStatus::Cancelled,
                violations: Vec::new(),
                error: Some("cancel_requested".to_string()),
                worker_id: Some(self.worker_id.clone()),
                execution_ms: Some(started.elapsed().as_millis() as u64),
            }));
        }

        let outcome = match ValidatorKind::parse(&task.validator_kind) {
            Some(kind) => match self.registry.get(kind) {
                Some(validator) => validator(&task),
                None => Err(CodewardError::ValidationError(format!(
                    "validator kind {} has no registry entry",
                    task.validator_kind
                ))),
            },
            None => Err(CodewardError::ValidationError(format!(
                "unknown validator kind: {}",
                task.validator_kind
            ))),
        };

        // Still-alive signal before reporting; a renewal refused means the
        // lease expired under us and the task is no longer ours.
        if !self.queue.renew_lease(&task.task_id, &lease_id, self.lease_secs)? {
            return Ok(None);
        }

        let result = match outcome {
            Ok(violations) => {
                let result = TaskResult {
                    task_id: task.task_id.clone(),
                    status: TaskStatus::Completed,
                    violations,
                    error: None,
                    worker_id: Some(self.worker_id.clone()),
                    execution_ms: Some(started.elapsed().as_millis() as u64),
                };
                self.report(|| self.queue.complete(&task.task_id, &lease_id, &result))?;
                result
            }
            Err(e) => {
                let message = e.to_string();
                self.report(|| self.queue.fail(&task.task_id, &lease_id, &message))?;
                TaskResult {
                    task_id: task.task_id.clone(),
                    status: TaskStatus::Failed,
                    violations: Vec::new(),
                    error: Some(message),
                    worker_id: Some(self.worker_id.clone()),
                    execution_ms: Some(started.elapsed().as_millis() as u64),
                }
            }
        };
        Ok(Some(result))
    }

    /// Processes tasks until the queue is drained; returns how many ran.
    pub fn run_until_idle(&self) -> Result<u64, CodewardError> {
        let mut processed = 0;
        while self.run_once()?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Bounded backoff for result reporting; a lost report would strand the
    /// lease until expiry, so it is worth a few attempts.
    fn report(
        &self,
        mut f: impl FnMut() -> Result<bool, CodewardError>,
    ) -> Result<bool, CodewardError> {
        let mut backoff = Duration::from_millis(10);
        let mut attempt = 0;
        loop {
            match f() {
                Ok(acknowledged) => return Ok(acknowledged),
                Err(e @ CodewardError::RusqliteError(_)) | Err(e @ CodewardError::IoError(_)) => {
                    attempt += 1;
                    if attempt >= self.report_attempts {
                        return Err(e);
                    }
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
