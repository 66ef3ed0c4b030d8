//! Store abstraction for Codeward's governed state.
//!
//! A Store is the directory that holds everything Codeward persists for one
//! governed workspace: the validation queue database, snapshot storage, and
//! the append-only event logs. Sessions, orchestrators, and workers all hang
//! off the same store root.

use crate::core::error::CodewardError;
use std::fs;
use std::path::{Path, PathBuf};

/// Store handle for a Codeward state directory.
///
/// Conventionally `<workspace>/.codeward/`, but any directory works; tests
/// point it at a tempdir.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory.
    pub root: PathBuf,
}

impl Store {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the store directory if needed and returns a handle to it.
    pub fn ensure(root: impl Into<PathBuf>) -> Result<Self, CodewardError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(CodewardError::IoError)?;
        Ok(Self { root })
    }

    /// Directory holding snapshot blobs and manifests.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn events_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl AsRef<Path> for Store {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}
