use codeward::core::error::CodewardError;
use codeward::core::snapshot::{SnapshotStore, hash_bytes};
use codeward::core::time;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn read_tree(root: &Path) -> Vec<(String, String)> {
    fn recurse(dir: &Path, base: &Path, out: &mut Vec<(String, String)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                recurse(&path, base, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_string_lossy().to_string();
                out.push((rel, fs::read_to_string(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    recurse(root, root, &mut out);
    out.sort();
    out
}

#[test]
fn capture_restore_round_trip_is_byte_exact() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(
        &workspace,
        &[
            ("src/main.rs", "fn main() { println!(\"v1\"); }\n"),
            ("src/util/mod.rs", "pub fn helper() -> u32 { 7 }\n"),
            ("Cargo.toml", "[package]\nname = \"demo\"\n"),
        ],
    );
    let store = SnapshotStore::open(tmp.path().join("snapstore")).expect("open");

    let snapshot = store.capture(&workspace, None).expect("capture");
    let original = read_tree(&workspace);

    // Wreck the workspace, then restore.
    fs::write(workspace.join("src/main.rs"), "corrupted").unwrap();
    fs::remove_file(workspace.join("Cargo.toml")).unwrap();
    write_tree(&workspace, &[("stray.txt", "should disappear")]);

    let result = store.restore(&snapshot.id, &workspace).expect("restore");
    assert_eq!(read_tree(&workspace), original);
    assert!(result.removed.contains(&"stray.txt".to_string()));
}

#[test]
fn restore_is_idempotent() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "alpha"), ("b/c.txt", "gamma")]);
    let store = SnapshotStore::open(tmp.path().join("snapstore")).expect("open");

    let snapshot = store.capture(&workspace, None).expect("capture");
    store.restore(&snapshot.id, &workspace).expect("first restore");
    let first = read_tree(&workspace);
    store.restore(&snapshot.id, &workspace).expect("second restore");
    assert_eq!(read_tree(&workspace), first);
}

#[test]
fn blobs_are_deduplicated_by_content() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    // Three files, two distinct contents.
    write_tree(
        &workspace,
        &[("a.txt", "same"), ("b.txt", "same"), ("c.txt", "different")],
    );
    let storage = tmp.path().join("snapstore");
    let store = SnapshotStore::open(&storage).expect("open");
    store.capture(&workspace, None).expect("capture");

    let blob_count = fs::read_dir(storage.join("blobs")).unwrap().count();
    assert_eq!(blob_count, 2);

    // A second identical capture adds no blobs and lands on the same id.
    let again = store.capture(&workspace, None).expect("recapture");
    assert_eq!(fs::read_dir(storage.join("blobs")).unwrap().count(), 2);
    assert_eq!(again.files.get("a.txt"), Some(&hash_bytes(b"same")));
}

#[test]
fn unknown_snapshot_and_missing_blob_are_typed_errors() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "alpha")]);
    let storage = tmp.path().join("snapstore");
    let store = SnapshotStore::open(&storage).expect("open");

    let err = store.restore("no-such-snapshot", &workspace).unwrap_err();
    assert!(matches!(err, CodewardError::SnapshotNotFound(_)));

    let snapshot = store.capture(&workspace, None).expect("capture");
    let blob = storage.join("blobs").join(snapshot.files.get("a.txt").unwrap());
    fs::remove_file(&blob).unwrap();

    let before = read_tree(&workspace);
    let err = store.restore(&snapshot.id, &workspace).unwrap_err();
    assert!(matches!(err, CodewardError::Integrity(_)));
    // Failed restore left the target untouched.
    assert_eq!(read_tree(&workspace), before);
}

#[test]
fn corrupted_blob_fails_integrity_check() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "alpha")]);
    let storage = tmp.path().join("snapstore");
    let store = SnapshotStore::open(&storage).expect("open");

    let snapshot = store.capture(&workspace, None).expect("capture");
    let blob = storage.join("blobs").join(snapshot.files.get("a.txt").unwrap());
    fs::write(&blob, "tampered").unwrap();

    let failures = store.verify(&snapshot.id).expect("verify runs");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("hash mismatch"));

    let err = store.restore(&snapshot.id, &workspace).unwrap_err();
    assert!(matches!(err, CodewardError::Integrity(_)));
}

#[test]
fn parent_links_form_walkable_lineage() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "v1")]);
    let store = SnapshotStore::open(tmp.path().join("snapstore")).expect("open");

    let first = store.capture(&workspace, None).expect("capture 1");
    fs::write(workspace.join("a.txt"), "v2").unwrap();
    let second = store.capture(&workspace, Some(first.id.as_str())).expect("capture 2");
    fs::write(workspace.join("a.txt"), "v3").unwrap();
    let third = store.capture(&workspace, Some(second.id.as_str())).expect("capture 3");

    let lineage = store.lineage(&third.id).expect("lineage");
    assert_eq!(lineage, vec![third.id.clone(), second.id.clone(), first.id.clone()]);

    let err = store.capture(&workspace, Some("missing-parent")).unwrap_err();
    assert!(matches!(err, CodewardError::SnapshotNotFound(_)));
}

#[test]
fn diff_reports_added_removed_changed() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("keep.txt", "same"), ("edit.txt", "v1"), ("drop.txt", "bye")]);
    let store = SnapshotStore::open(tmp.path().join("snapstore")).expect("open");
    let first = store.capture(&workspace, None).expect("capture 1");

    fs::write(workspace.join("edit.txt"), "v2").unwrap();
    fs::remove_file(workspace.join("drop.txt")).unwrap();
    write_tree(&workspace, &[("new.txt", "hello")]);
    let second = store.capture(&workspace, Some(first.id.as_str())).expect("capture 2");

    let diff = store.diff(&first.id, &second.id).expect("diff");
    assert_eq!(diff.added, vec!["new.txt".to_string()]);
    assert_eq!(diff.removed, vec!["drop.txt".to_string()]);
    assert_eq!(diff.changed, vec!["edit.txt".to_string()]);
}

#[test]
fn prune_never_deletes_ancestors_of_retained_snapshots() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "v1")]);
    let storage = tmp.path().join("snapstore");
    let store = SnapshotStore::open(&storage).expect("open");

    let first = store.capture(&workspace, None).expect("capture 1");
    fs::write(workspace.join("a.txt"), "v2").unwrap();
    let second = store.capture(&workspace, Some(first.id.as_str())).expect("capture 2");

    // Orphan branch with no retained descendant.
    fs::write(workspace.join("a.txt"), "orphan").unwrap();
    let orphan = store.capture(&workspace, None).expect("capture orphan");

    let cutoff = time::now_epoch_secs() + 10;
    let pruned = store.prune(cutoff, &[second.id.as_str()]).expect("prune");
    assert_eq!(pruned, vec![orphan.id.clone()]);

    // The retained chain survives intact and restorable.
    assert!(store.get(&first.id).is_ok());
    assert!(store.get(&second.id).is_ok());
    assert!(store.get(&orphan.id).is_err());
    store.restore(&second.id, &workspace).expect("chain restorable");

    // Orphaned blobs were garbage-collected: only v1 + v2 remain.
    assert_eq!(fs::read_dir(storage.join("blobs")).unwrap().count(), 2);
}

#[test]
fn concurrent_captures_on_same_path_serialize() {
    use std::sync::Arc;
    use std::thread;

    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("ws");
    write_tree(&workspace, &[("a.txt", "stable")]);
    let store = Arc::new(SnapshotStore::open(tmp.path().join("snapstore")).expect("open"));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let workspace = workspace.clone();
        handles.push(thread::spawn(move || store.capture(&workspace, None).map(|m| m.id)));
    }
    let ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().expect("thread").expect("capture"))
        .collect();
    // Identical content -> identical snapshot id, no torn manifests.
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(store.verify(&ids[0]).expect("verify"), Vec::<String>::new());
}
