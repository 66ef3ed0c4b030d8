use codeward::core::emergency::EmergencyStopConfig;
use codeward::core::error::CodewardError;
use codeward::core::protocol::{Action, ProtocolDeclaration, SafetyLevel};
use codeward::core::session::{Decision, ProtocolSession, SessionState, ValidationOutcome};
use codeward::core::store::Store;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn declaration(json: &str) -> ProtocolDeclaration {
    ProtocolDeclaration::from_json_str(json).expect("declaration parses")
}

fn session_with(root: &Path, workspace: &Path, json: &str) -> ProtocolSession {
    let store = Store::ensure(root.join(".codeward")).expect("store");
    let mut session = ProtocolSession::create(
        &store,
        workspace,
        &declaration(json),
        EmergencyStopConfig::default(),
    )
    .expect("session creates");
    session.activate().expect("activate");
    session
}

#[test]
fn read_only_scope_scenario() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(workspace.join("src")).unwrap();
    fs::write(workspace.join("src/a.py"), "print('hi')\n").unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{"safety_level": "read_only", "access_scope": "project"}"#,
    );

    let write = session
        .propose_action(&Action::modify("/src/a.py", "print('bye')\n"))
        .expect("propose");
    assert_eq!(
        write,
        Decision::Deny("safety_level_forbids_mutation".to_string())
    );

    let read = session.propose_action(&Action::read("/src/a.py")).expect("propose");
    assert_eq!(read, Decision::Allow);
}

#[test]
fn read_only_never_allows_any_mutation_kind() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{"safety_level": "read_only", "access_scope": "workspace"}"#,
    );

    for action in [
        Action::modify("a.rs", "x"),
        Action::create("b.rs", "y"),
        Action::delete("c.rs"),
    ] {
        let decision = session.propose_action(&action).expect("propose");
        assert!(
            !decision.is_allowed(),
            "mutation allowed under read_only: {:?}",
            decision
        );
    }
}

#[test]
fn suggest_only_permits_suggestions_but_not_writes() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{"safety_level": "suggest_only", "access_scope": "project"}"#,
    );

    let suggest = session
        .propose_action(&Action::suggest("src/main.rs", "+ refactor here"))
        .expect("propose");
    assert_eq!(suggest, Decision::Allow);

    let write = session
        .propose_action(&Action::modify("src/main.rs", "fn main() {}"))
        .expect("propose");
    assert_eq!(
        write,
        Decision::Deny("safety_level_forbids_mutation".to_string())
    );
}

#[test]
fn max_changes_per_session_scenario() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"max_changes_per_session": 2, "require_human_review": false}
        }"#,
    );

    for i in 0..2 {
        let decision = session
            .propose_action(&Action::modify(&format!("src/f{}.rs", i), "fn f() {}"))
            .expect("propose");
        assert!(decision.is_allowed(), "change {} should be allowed", i);
    }
    let third = session
        .propose_action(&Action::modify("src/f2.rs", "fn f() {}"))
        .expect("propose");
    assert_eq!(
        third,
        Decision::Deny("max_changes_per_session_exceeded".to_string())
    );
}

#[test]
fn scope_containment_denies_out_of_scope_paths() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "directory",
            "scope_path": "src/api",
            "constraints": {"require_human_review": false}
        }"#,
    );

    let inside = session
        .propose_action(&Action::modify("src/api/handler.rs", "fn h() {}"))
        .expect("propose");
    assert!(inside.is_allowed());

    let outside = session
        .propose_action(&Action::modify("src/db/schema.rs", "fn s() {}"))
        .expect("propose");
    assert_eq!(
        outside,
        Decision::Deny("path_outside_access_scope".to_string())
    );
}

#[test]
fn require_human_review_upgrades_mutations() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"require_human_review": true}
        }"#,
    );

    let write = session
        .propose_action(&Action::modify("src/a.rs", "fn a() {}"))
        .expect("propose");
    assert_eq!(write, Decision::AllowWithReview);

    // Reads are not upgraded.
    let read = session.propose_action(&Action::read("src/a.rs")).expect("propose");
    assert_eq!(read, Decision::Allow);
}

#[test]
fn critical_constraint_denies_even_without_review_requirement() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "full_access",
            "access_scope": "workspace",
            "constraints": {
                "require_human_review": false,
                "custom_rules": [
                    {"name": "no-secrets", "pattern": "API_KEY\\s*=", "mode": "forbidden", "severity": "CRITICAL"}
                ]
            }
        }"#,
    );

    let decision = session
        .propose_action(&Action::modify("config.rs", "const API_KEY = \"sk-123\";"))
        .expect("propose");
    assert_eq!(
        decision,
        Decision::Deny("forbidden_pattern_present".to_string())
    );
    assert_eq!(session.violation_log().len(), 1);
}

#[test]
fn commit_applies_mutation_and_links_snapshots() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();
    fs::write(workspace.join("lib.rs"), "// old\n").unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"require_human_review": false}
        }"#,
    );

    let action = Action::modify("lib.rs", "// new\n");
    let decision = session.propose_action(&action).expect("propose");
    assert!(decision.is_allowed());

    let receipt = session
        .commit_action(&action, &ValidationOutcome::clean())
        .expect("commit");
    assert_eq!(fs::read_to_string(workspace.join("lib.rs")).unwrap(), "// new\n");
    assert_ne!(receipt.snapshot_before, receipt.snapshot_after);
    assert_eq!(session.last_good_snapshot(), Some(receipt.snapshot_after.as_str()));

    let records = session
        .audit_log()
        .read_session(session.id())
        .expect("audit read");
    let commit = records.iter().find(|r| r.op == "commit").expect("commit record");
    assert_eq!(commit.snapshot_before.as_deref(), Some(receipt.snapshot_before.as_str()));
    assert_eq!(commit.snapshot_after.as_deref(), Some(receipt.snapshot_after.as_str()));

    // Sequence numbers are strictly increasing per session.
    let seqs: Vec<u64> = records.iter().map(|r| r.sequence_no).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted);
}

#[test]
fn commit_without_prior_allow_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"require_human_review": false}
        }"#,
    );

    let err = session
        .commit_action(&Action::modify("a.rs", "fn a() {}"), &ValidationOutcome::clean())
        .unwrap_err();
    assert!(matches!(err, CodewardError::ValidationError(_)));
}

#[test]
fn commit_outside_active_state_is_stale() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"require_human_review": false}
        }"#,
    );

    let action = Action::modify("a.rs", "fn a() {}");
    assert!(session.propose_action(&action).expect("propose").is_allowed());

    session.suspend().expect("suspend");
    let err = session
        .commit_action(&action, &ValidationOutcome::clean())
        .unwrap_err();
    assert!(matches!(err, CodewardError::StaleSession(_)));

    session.resume().expect("resume");
    session
        .commit_action(&action, &ValidationOutcome::clean())
        .expect("commit succeeds after resume");
}

#[test]
fn halt_is_idempotent_and_propose_reports_halted() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{"safety_level": "full_access", "access_scope": "workspace"}"#,
    );

    session.halt("operator_panic").expect("halt");
    assert_eq!(session.state(), SessionState::Halted);
    session.halt("operator_panic_again").expect("second halt is a no-op");
    assert_eq!(session.halt_reason(), Some("operator_panic"));

    let decision = session.propose_action(&Action::read("a.rs")).expect("propose");
    assert_eq!(decision, Decision::Halted);
}

#[test]
fn reset_from_halted_creates_fresh_session_with_lineage() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();
    fs::write(workspace.join("a.rs"), "fn a() {}\n").unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {"require_human_review": false}
        }"#,
    );

    let action = Action::modify("a.rs", "fn a() { /* v2 */ }\n");
    assert!(session.propose_action(&action).expect("propose").is_allowed());
    let receipt = session
        .commit_action(&action, &ValidationOutcome::clean())
        .expect("commit");

    session.halt("too_many_errors").expect("halt");
    let old_id = session.id().to_string();

    let next = session
        .reset_from_halted("operator", "incident-2207")
        .expect("reset");
    assert_eq!(next.state(), SessionState::Active);
    assert_ne!(next.id(), old_id);
    assert_eq!(next.reset_of(), Some(old_id.as_str()));
    assert_eq!(next.last_good_snapshot(), Some(receipt.snapshot_after.as_str()));
}

#[test]
fn closed_session_rejects_proposals() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let mut session = session_with(
        tmp.path(),
        &workspace,
        r#"{"safety_level": "read_only", "access_scope": "project"}"#,
    );
    session.close().expect("close");
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.propose_action(&Action::read("a.rs")).unwrap_err();
    assert!(matches!(err, CodewardError::StaleSession(_)));
}

#[test]
fn declaration_requires_safety_level() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::ensure(tmp.path().join(".codeward")).expect("store");
    let decl = declaration(r#"{"access_scope": "project"}"#);
    let err = ProtocolSession::create(
        &store,
        tmp.path(),
        &decl,
        EmergencyStopConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CodewardError::InvalidProtocol(_)));
}

#[test]
fn malformed_custom_rule_fails_at_session_creation() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::ensure(tmp.path().join(".codeward")).expect("store");
    let decl = declaration(
        r#"{
            "safety_level": "controlled_modify",
            "access_scope": "project",
            "constraints": {
                "custom_rules": [
                    {"name": "broken", "pattern": "(unclosed", "mode": "forbidden", "severity": "HIGH"}
                ]
            }
        }"#,
    );
    let err = ProtocolSession::create(
        &store,
        tmp.path(),
        &decl,
        EmergencyStopConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CodewardError::ConstraintConfig(_)));
}

#[test]
fn safety_level_ordering_is_strict() {
    assert!(SafetyLevel::ReadOnly < SafetyLevel::SuggestOnly);
    assert!(SafetyLevel::SuggestOnly < SafetyLevel::ControlledModify);
    assert!(SafetyLevel::ControlledModify < SafetyLevel::FullAccess);
}
