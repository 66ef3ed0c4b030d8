//! Protocol declarations: safety levels, access scopes, and the constraint
//! block an agent session is created from.
//!
//! A declaration is a structured document (JSON or TOML). Unknown fields are
//! ignored; a missing `safety_level` fails session creation with
//! `InvalidProtocol`. Declarations compile into an immutable
//! [`SessionPolicy`]; compilation is where malformed patterns are rejected,
//! never evaluation.

use crate::core::constraint::{Constraint, ConstraintRule, Severity, compile_pattern};
use crate::core::error::CodewardError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ordered permission tier governing what an agent may do.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Read and analyze only.
    ReadOnly,
    /// May propose suggestions, never modify.
    SuggestOnly,
    /// May modify under full validation.
    ControlledModify,
    /// May modify; everything still audited.
    FullAccess,
}

/// Boundary within which an agent's actions are in-scope.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    SingleFile,
    Directory,
    Project,
    Workspace,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Read,
    Suggest,
    Modify,
    Create,
    Delete,
}

impl ActionKind {
    pub fn is_mutation(self) -> bool {
        matches!(self, ActionKind::Modify | ActionKind::Create | ActionKind::Delete)
    }
}

/// One proposed agent action. Paths are workspace-relative; a leading `/` is
/// tolerated and stripped.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
}

impl Action {
    pub fn read(path: &str) -> Self {
        Self { kind: ActionKind::Read, path: path.to_string(), content: None, diff: None }
    }

    pub fn suggest(path: &str, diff: &str) -> Self {
        Self {
            kind: ActionKind::Suggest,
            path: path.to_string(),
            content: None,
            diff: Some(diff.to_string()),
        }
    }

    pub fn modify(path: &str, content: &str) -> Self {
        Self {
            kind: ActionKind::Modify,
            path: path.to_string(),
            content: Some(content.to_string()),
            diff: None,
        }
    }

    pub fn create(path: &str, content: &str) -> Self {
        Self {
            kind: ActionKind::Create,
            path: path.to_string(),
            content: Some(content.to_string()),
            diff: None,
        }
    }

    pub fn delete(path: &str) -> Self {
        Self { kind: ActionKind::Delete, path: path.to_string(), content: None, diff: None }
    }

    /// Workspace-relative form of the target path.
    pub fn rel_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_MAX_CHANGES_PER_SESSION: u32 = 50;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    Required,
    Forbidden,
}

/// Custom rule entry: `{name, pattern, required|forbidden, severity}`.
#[derive(Debug, Deserialize, Clone)]
pub struct CustomRuleDecl {
    pub name: String,
    pub pattern: String,
    pub mode: RuleMode,
    pub severity: Severity,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConstraintsDecl {
    pub max_file_size: Option<u64>,
    pub max_changes_per_session: Option<u32>,
    pub max_changes_per_file: Option<u32>,
    pub require_human_review: Option<bool>,
    pub allowed_file_types: Option<Vec<String>>,
    #[serde(default)]
    pub custom_rules: Vec<CustomRuleDecl>,
}

/// The protocol declaration consumed at session creation.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProtocolDeclaration {
    pub version: Option<String>,
    pub safety_level: Option<SafetyLevel>,
    pub access_scope: Option<AccessScope>,
    /// Scope anchor for `single_file` / `directory` scopes, workspace-relative.
    pub scope_path: Option<String>,
    #[serde(default)]
    pub constraints: ConstraintsDecl,
}

impl ProtocolDeclaration {
    pub fn from_json_str(s: &str) -> Result<Self, CodewardError> {
        serde_json::from_str(s).map_err(|e| CodewardError::InvalidProtocol(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CodewardError> {
        toml::from_str(s).map_err(|e| CodewardError::InvalidProtocol(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, CodewardError> {
        let content = std::fs::read_to_string(path).map_err(CodewardError::IoError)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Compiles the declaration into an immutable session policy, failing
    /// fast on missing required fields and malformed patterns.
    pub fn compile(&self, workspace_root: &Path) -> Result<SessionPolicy, CodewardError> {
        let safety_level = self.safety_level.ok_or_else(|| {
            CodewardError::InvalidProtocol("missing required field: safety_level".to_string())
        })?;
        let access_scope = self.access_scope.unwrap_or(AccessScope::SingleFile);

        let scope_path = self
            .scope_path
            .as_deref()
            .map(|p| p.trim_start_matches('/').to_string());
        if matches!(access_scope, AccessScope::SingleFile | AccessScope::Directory)
            && scope_path.is_none()
        {
            return Err(CodewardError::InvalidProtocol(format!(
                "access_scope {:?} requires scope_path",
                access_scope
            )));
        }

        let decl = &self.constraints;
        let max_changes_per_session = decl
            .max_changes_per_session
            .unwrap_or(DEFAULT_MAX_CHANGES_PER_SESSION);

        let mut constraints = vec![
            Constraint {
                name: "max_file_size".to_string(),
                severity: Severity::HIGH,
                rule: ConstraintRule::MaxFileSize(
                    decl.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
                ),
            },
            Constraint {
                name: "max_changes_per_session".to_string(),
                severity: Severity::HIGH,
                rule: ConstraintRule::MaxChangesPerSession(max_changes_per_session),
            },
        ];
        if let Some(limit) = decl.max_changes_per_file {
            constraints.push(Constraint {
                name: "max_changes_per_file".to_string(),
                severity: Severity::HIGH,
                rule: ConstraintRule::MaxChangesPerFile(limit),
            });
        }
        if let Some(exts) = &decl.allowed_file_types {
            constraints.push(Constraint {
                name: "allowed_file_types".to_string(),
                severity: Severity::HIGH,
                rule: ConstraintRule::AllowedFileTypes(exts.clone()),
            });
        }
        for rule in &decl.custom_rules {
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

        Ok(SessionPolicy {
            safety_level,
            access_scope,
            scope_path,
            workspace_root: workspace_root.to_path_buf(),
            require_human_review: decl.require_human_review.unwrap_or(true),
            constraints,
        })
    }
}

/// Immutable, compiled form of a protocol declaration. Owned by exactly one
/// session; never shared or mutated after creation.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub safety_level: SafetyLevel,
    pub access_scope: AccessScope,
    pub scope_path: Option<String>,
    pub workspace_root: PathBuf,
    pub require_human_review: bool,
    pub constraints: Vec<Constraint>,
}

impl SessionPolicy {
    /// Level gate: does the declared safety level permit this action kind at
    /// all? Scope and constraints are separate checks.
    pub fn permits(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Read => true,
            ActionKind::Suggest => self.safety_level >= SafetyLevel::SuggestOnly,
            _ => self.safety_level >= SafetyLevel::ControlledModify,
        }
    }

    /// Scope containment for a workspace-relative path. Traversal components
    /// are always out of scope.
    pub fn contains(&self, rel_path: &str) -> bool {
        if rel_path.split('/').any(|c| c == "..") {
            return false;
        }
        match self.access_scope {
            AccessScope::SingleFile => self.scope_path.as_deref() == Some(rel_path),
            AccessScope::Directory => {
                let Some(dir) = self.scope_path.as_deref() else {
                    return false;
                };
                let dir = dir.trim_end_matches('/');
                rel_path == dir || rel_path.starts_with(&format!("{}/", dir))
            }
            AccessScope::Project | AccessScope::Workspace => true,
        }
    }
}
