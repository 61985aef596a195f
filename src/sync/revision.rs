//! Revision marker persistence
//!
//! The revision marker is a single-line file holding the last revision the
//! control server handed out. It is read once at startup and rewritten only
//! after a successful apply, always through a temporary file and a rename.

use crate::sync::error::SyncError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// Default file name of the revision marker, next to the configuration file
pub const DEFAULT_REVISION_FILE: &str = "syncagent-revision";

/// Opaque server-assigned revision identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads and atomically rewrites the revision marker file
#[derive(Debug, Clone)]
pub struct RevisionStore {
    path: PathBuf,
}

impl RevisionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored revision. A missing or empty marker means the agent has
    /// never applied a server revision.
    pub fn load(&self) -> Result<Option<Revision>, SyncError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io("failed to read revision marker", &self.path, e)),
        };

        let revision = Revision::new(contents.lines().next().unwrap_or_default());
        if revision.is_empty() {
            Ok(None)
        } else {
            info!("Current revision is {}", revision);
            Ok(Some(revision))
        }
    }

    /// Overwrite the marker with `revision`
    pub fn store(&self, revision: &Revision) -> Result<(), SyncError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| SyncError::io("failed to create temporary marker in", &dir, e))?;
        writeln!(tmp, "{}", revision)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| SyncError::io("failed to write revision marker", tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| SyncError::io("failed to persist revision marker", &self.path, e.error))?;

        info!("Revision {} written to {}", revision, self.path.display());
        Ok(())
    }

    /// Remove the marker; a missing marker is not an error
    pub fn clear(&self) -> Result<(), SyncError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io("failed to remove revision marker", &self.path, e)),
        }
    }
}
