//! Content-addressed workspace snapshots with atomic capture and restore.
//!
//! Storage layout under the store's `snapshots/` directory:
//! - `blobs/<sha256>`: deduplicated file contents, written once, never mutated
//! - `manifests/<id>.json`: snapshot manifests (id = hash of the manifest body)
//! - `staging/`: scratch space for temp-then-rename writes and staged restores
//!
//! Capture is atomic: blobs are persisted first, then the manifest lands via
//! a temp-file rename. A crash mid-capture leaves orphan blobs (reclaimed by
//! `prune`) but never a visible half-snapshot. Restore verifies every blob in
//! a staging area before anything touches the target.

use crate::core::error::CodewardError;
use crate::core::time;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SnapshotManifest {
    /// Content hash of the manifest body; identical captures share an id.
    pub id: String,
    /// Parent snapshot, forming a linear or branching history. Parents never
    /// point at children, so the graph cannot cycle.
    pub parent: Option<String>,
    pub created_at: String,
    /// Workspace-relative path -> blob hash.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RestoreResult {
    pub snapshot_id: String,
    pub restored: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    lock_wait: Duration,
    /// Per-workspace-path locks. Captures on different paths proceed
    /// concurrently; same-path callers queue with a bounded wait.
    path_locks: Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CodewardError> {
        let root: PathBuf = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("manifests"))?;
        fs::create_dir_all(root.join("staging"))?;
        Ok(Self {
            root,
            lock_wait: DEFAULT_LOCK_WAIT,
            path_locks: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.manifests_dir().join(format!("{}.json", id))
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blobs_dir().join(hash)
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Runs `f` holding the lock for `path`, waiting at most `lock_wait`.
    /// The guard is released on every exit path, including errors.
    fn with_path_lock<R>(
        &self,
        path: &Path,
        f: impl FnOnce() -> Result<R, CodewardError>,
    ) -> Result<R, CodewardError> {
        let lock = self.path_lock(path);
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match lock.try_lock() {
                Ok(_guard) => return f(),
                Err(TryLockError::Poisoned(poisoned)) => {
                    let _guard = poisoned.into_inner();
                    return f();
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(CodewardError::LockTimeout(path.display().to_string()));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
            }
        }
    }

    /// Captures the workspace into a new snapshot, writing blobs only for
    /// content not already stored.
    pub fn capture(
        &self,
        workspace: &Path,
        parent: Option<&str>,
    ) -> Result<SnapshotManifest, CodewardError> {
        if let Some(parent_id) = parent {
            if !self.manifest_path(parent_id).exists() {
                return Err(CodewardError::SnapshotNotFound(parent_id.to_string()));
            }
        }
        let parent = parent.map(|s| s.to_string());

        self.with_path_lock(workspace, || {
            let mut file_list = Vec::new();
            collect_files(workspace, workspace, &self.root, &mut file_list)?;

            let hashed: Vec<(String, String, Vec<u8>)> = file_list
                .par_iter()
                .map(|(rel, abs)| {
                    let bytes = fs::read(abs).map_err(CodewardError::IoError)?;
                    let hash = hash_bytes(&bytes);
                    Ok((rel.clone(), hash, bytes))
                })
                .collect::<Result<Vec<_>, CodewardError>>()?;

            let mut files = BTreeMap::new();
            let mut written: FxHashSet<String> = FxHashSet::default();
            for (rel, hash, bytes) in &hashed {
                files.insert(rel.clone(), hash.clone());
                if written.contains(hash) || self.blob_path(hash).exists() {
                    continue;
                }
                self.write_atomic(&self.blob_path(hash), bytes)?;
                written.insert(hash.clone());
            }

            let manifest = SnapshotManifest {
                id: manifest_id(parent.as_deref(), &files),
                parent,
                created_at: time::now_epoch_z(),
                files,
            };
            let body = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| CodewardError::ValidationError(e.to_string()))?;
            self.write_atomic(&self.manifest_path(&manifest.id), &body)?;
            Ok(manifest)
        })
    }

    /// Temp-then-rename write; the destination is either absent or complete.
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), CodewardError> {
        let tmp = self.staging_dir().join(time::new_event_id());
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, dest)?;
        Ok(())
    }

    pub fn get(&self, snapshot_id: &str) -> Result<SnapshotManifest, CodewardError> {
        let path = self.manifest_path(snapshot_id);
        if !path.exists() {
            return Err(CodewardError::SnapshotNotFound(snapshot_id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| CodewardError::Integrity(format!("manifest {}: {}", snapshot_id, e)))
    }

    pub fn list_ids(&self) -> Result<Vec<String>, CodewardError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.manifests_dir())? {
            let entry = entry?;
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Restores a snapshot into `target`, all-or-nothing. Every blob is
    /// verified into a staging tree before the first byte lands in the
    /// target; paths absent from the manifest are removed afterwards so the
    /// result matches the captured state exactly.
    pub fn restore(
        &self,
        snapshot_id: &str,
        target: &Path,
    ) -> Result<RestoreResult, CodewardError> {
        let manifest = self.get(snapshot_id)?;

        self.with_path_lock(target, || {
            let stage = self.staging_dir().join(time::new_event_id());
            let staged = self.stage_verified(&manifest, &stage);
            let staged = match staged {
                Ok(staged) => staged,
                Err(e) => {
                    let _ = fs::remove_dir_all(&stage);
                    return Err(e);
                }
            };

            let mut restored = Vec::new();
            for (rel, staged_path) in staged {
                let dest = target.join(&rel);
                if let Some(dir) = dest.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::rename(&staged_path, &dest)?;
                restored.push(rel);
            }
            let _ = fs::remove_dir_all(&stage);

            let mut existing = Vec::new();
            collect_files(target, target, &self.root, &mut existing)?;
            let mut removed = Vec::new();
            for (rel, abs) in existing {
                if !manifest.files.contains_key(&rel) {
                    fs::remove_file(&abs)?;
                    removed.push(rel);
                }
            }

            Ok(RestoreResult { snapshot_id: manifest.id.clone(), restored, removed })
        })
    }

    /// Copies every referenced blob into `stage`, verifying hashes. Fails
    /// without touching the restore target.
    fn stage_verified(
        &self,
        manifest: &SnapshotManifest,
        stage: &Path,
    ) -> Result<Vec<(String, PathBuf)>, CodewardError> {
        let mut staged = Vec::new();
        for (rel, hash) in &manifest.files {
            let blob = self.blob_path(hash);
            if !blob.exists() {
                return Err(CodewardError::Integrity(format!(
                    "snapshot {}: missing blob {} for {}",
                    manifest.id, hash, rel
                )));
            }
            let bytes = fs::read(&blob)?;
            let actual = hash_bytes(&bytes);
            if actual != *hash {
                return Err(CodewardError::Integrity(format!(
                    "snapshot {}: blob hash mismatch for {} (expected {}, got {})",
                    manifest.id, rel, hash, actual
                )));
            }
            let staged_path = stage.join(rel);
            if let Some(dir) = staged_path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&staged_path, &bytes)?;
            staged.push((rel.clone(), staged_path));
        }
        Ok(staged)
    }

    /// Integrity scan over one snapshot: reports missing or corrupt blobs
    /// without modifying anything.
    pub fn verify(&self, snapshot_id: &str) -> Result<Vec<String>, CodewardError> {
        let manifest = self.get(snapshot_id)?;
        let mut failures = Vec::new();
        for (rel, hash) in &manifest.files {
            let blob = self.blob_path(hash);
            if !blob.exists() {
                failures.push(format!("{}: missing blob {}", rel, hash));
                continue;
            }
            let bytes = fs::read(&blob)?;
            if hash_bytes(&bytes) != *hash {
                failures.push(format!("{}: blob hash mismatch", rel));
            }
        }
        Ok(failures)
    }

    /// Ancestor chain starting at `snapshot_id`, oldest last. Lineage is
    /// computed by walking parent links only.
    pub fn lineage(&self, snapshot_id: &str) -> Result<Vec<String>, CodewardError> {
        let mut chain = Vec::new();
        let mut cursor = Some(snapshot_id.to_string());
        while let Some(id) = cursor {
            let manifest = self.get(&id)?;
            chain.push(id);
            cursor = manifest.parent;
        }
        Ok(chain)
    }

    pub fn diff(&self, from_id: &str, to_id: &str) -> Result<SnapshotDiff, CodewardError> {
        let from = self.get(from_id)?;
        let to = self.get(to_id)?;
        let mut diff = SnapshotDiff::default();
        for (path, hash) in &to.files {
            match from.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != hash => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in from.files.keys() {
            if !to.files.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        Ok(diff)
    }

    /// Deletes snapshots created before `before_epoch`, except any snapshot
    /// that is an ancestor of an id in `keep_chain_to`. Blobs no longer
    /// referenced by a surviving manifest are garbage-collected.
    pub fn prune(
        &self,
        before_epoch: u64,
        keep_chain_to: &[&str],
    ) -> Result<Vec<String>, CodewardError> {
        let mut keep: FxHashSet<String> = FxHashSet::default();
        for id in keep_chain_to {
            for ancestor in self.lineage(id)? {
                keep.insert(ancestor);
            }
        }

        let mut pruned = Vec::new();
        for id in self.list_ids()? {
            if keep.contains(&id) {
                continue;
            }
            let manifest = self.get(&id)?;
            let created = time::epoch_secs_of(&manifest.created_at).unwrap_or(u64::MAX);
            if created < before_epoch {
                fs::remove_file(self.manifest_path(&id))?;
                pruned.push(id);
            }
        }

        let mut referenced: FxHashSet<String> = FxHashSet::default();
        for id in self.list_ids()? {
            for hash in self.get(&id)?.files.values() {
                referenced.insert(hash.clone());
            }
        }
        for entry in fs::read_dir(self.blobs_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !referenced.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }

        Ok(pruned)
    }
}

/// Snapshot ids are content hashes of the manifest body, so identical
/// captures of identical trees collide into the same snapshot.
fn manifest_id(parent: Option<&str>, files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or(""));
    for (path, hash) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Walks `dir` collecting (workspace-relative, absolute) file pairs, skipping
/// VCS metadata and the snapshot storage itself when it nests inside the
/// workspace.
fn collect_files(
    dir: &Path,
    base: &Path,
    storage_root: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), CodewardError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let name = dir.file_name().and_then(|s| s.to_str()).unwrap_or("");
    if name == ".git" || name == ".codeward" || dir == storage_root {
        return Ok(());
    }

    for entry in fs::read_dir(dir).map_err(CodewardError::IoError)? {
        let entry = entry.map_err(CodewardError::IoError)?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, base, storage_root, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, path));
        }
    }
    Ok(())
}
