//! Constraint model and the pure evaluation pipeline.
//!
//! A constraint set is compiled once at session load (malformed patterns fail
//! fast with `ConstraintConfig`) and is immutable afterwards. Evaluation is
//! side-effect-free over one proposed change, so the same code runs inline in
//! a session and inside a remote validation worker.

use crate::core::error::CodewardError;
use crate::core::protocol::Action;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    #[serde(alias = "low")]
    LOW = 0, // Advisory, logged only
    #[serde(alias = "medium")]
    MEDIUM = 1, // Allowed, but flagged for review
    #[serde(alias = "high")]
    HIGH = 2, // Denied
    #[serde(alias = "critical")]
    CRITICAL = 3, // Denied regardless of any override
}

/// Closed set of rule kinds. New kinds are a code change, not a plugin.
#[derive(Debug, Clone)]
pub enum ConstraintRule {
    PatternRequired(Regex),
    PatternForbidden(Regex),
    MaxFileSize(u64),
    MaxChangesPerSession(u32),
    MaxChangesPerFile(u32),
    AllowedFileTypes(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: String,
    pub severity: Severity,
    pub rule: ConstraintRule,
}

/// A recorded failure of one constraint for one action. Produced, never
/// mutated; sessions append these to their violation log.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Violation {
    pub constraint: String,
    pub severity: Severity,
    pub location: String,
    /// Machine-readable reason code, e.g. `max_changes_per_session_exceeded`.
    pub reason: String,
    pub message: String,
}

/// Counter snapshot the validator needs for numeric-bound rules. The session
/// owns the live counters; this is a copy taken at propose time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChangeCounters {
    pub session_changes: u32,
    pub file_changes: u32,
}

/// Compiles a declared pattern, failing fast at load time.
pub fn compile_pattern(name: &str, pattern: &str) -> Result<Regex, CodewardError> {
    Regex::new(pattern).map_err(|e| {
        CodewardError::ConstraintConfig(format!("rule '{}': bad pattern '{}': {}", name, pattern, e))
    })
}

/// Stateless evaluator over an immutable constraint set.
#[derive(Debug, Clone, Default)]
pub struct ConstraintValidator {
    constraints: Vec<Constraint>,
}

impl ConstraintValidator {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Evaluates every constraint in declaration order against one proposed
    /// change, producing zero or one violation per constraint. Order never
    /// decides the outcome; callers reduce by severity.
    pub fn evaluate(&self, action: &Action, counters: ChangeCounters) -> Vec<Violation> {
        let mut violations = Vec::new();
        for c in &self.constraints {
            if let Some(v) = evaluate_one(c, action, counters) {
                violations.push(v);
            }
        }
        violations
    }

    /// The single highest severity among the produced violations, if any.
    pub fn worst_severity(violations: &[Violation]) -> Option<Severity> {
        violations.iter().map(|v| v.severity).max()
    }
}

fn evaluate_one(c: &Constraint, action: &Action, counters: ChangeCounters) -> Option<Violation> {
    // Pattern rules run against the diff hunk when one is provided, else the
    // full content. Actions that carry no text (reads, deletes) are out of
    // pattern scope.
    let text = action.diff.as_deref().or(action.content.as_deref());

    match &c.rule {
        ConstraintRule::PatternRequired(re) => {
            let text = text?;
            if re.is_match(text) {
                None
            } else {
                Some(violation(
                    c,
                    &action.path,
                    "required_pattern_absent",
                    format!("required pattern '{}' not found", re.as_str()),
                ))
            }
        }
        ConstraintRule::PatternForbidden(re) => {
            let text = text?;
            let m = re.find(text)?;
            let line = text[..m.start()].lines().count().max(1);
            Some(Violation {
                constraint: c.name.clone(),
                severity: c.severity,
                location: format!("{}:{}", action.path, line),
                reason: "forbidden_pattern_present".to_string(),
                message: format!("forbidden pattern '{}' matched '{}'", re.as_str(), m.as_str()),
            })
        }
        ConstraintRule::MaxFileSize(limit) => {
            let size = action.content.as_deref().map(|s| s.len() as u64)?;
            if size > *limit {
                Some(violation(
                    c,
                    &action.path,
                    "max_file_size_exceeded",
                    format!("content is {} bytes, limit is {}", size, limit),
                ))
            } else {
                None
            }
        }
        ConstraintRule::MaxChangesPerSession(limit) => {
            if action.kind.is_mutation() && counters.session_changes >= *limit {
                Some(violation(
                    c,
                    &action.path,
                    "max_changes_per_session_exceeded",
                    format!("{} changes already allowed this session, limit is {}", counters.session_changes, limit),
                ))
            } else {
                None
            }
        }
        ConstraintRule::MaxChangesPerFile(limit) => {
            if action.kind.is_mutation() && counters.file_changes >= *limit {
                Some(violation(
                    c,
                    &action.path,
                    "max_changes_per_file_exceeded",
                    format!("{} changes already allowed for this file, limit is {}", counters.file_changes, limit),
                ))
            } else {
                None
            }
        }
        ConstraintRule::AllowedFileTypes(exts) => {
            if !action.kind.is_mutation() {
                return None;
            }
            let ext = std::path::Path::new(&action.path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if exts.iter().any(|allowed| allowed.trim_start_matches('.') == ext) {
                None
            } else {
                Some(violation(
                    c,
                    &action.path,
                    "file_type_not_allowed",
                    format!("extension '{}' is not in the allowed list", ext),
                ))
            }
        }
    }
}

fn violation(c: &Constraint, path: &str, reason: &str, message: String) -> Violation {
    Violation {
        constraint: c.name.clone(),
        severity: c.severity,
        location: path.to_string(),
        reason: reason.to_string(),
        message,
    }
}
