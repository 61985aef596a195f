//! Candidate files and the commit step
//!
//! A candidate lives next to the file it will replace (`<name>.new`) so the
//! final rename never crosses a filesystem. Dropping an uncommitted candidate
//! removes it, which keeps every pre-commit failure free of side effects.

use crate::sync::error::SyncError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Path of the provisional copy for `active`
pub fn candidate_path(active: &Path) -> PathBuf {
    let mut name = active
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".new");
    active.with_file_name(name)
}

/// A provisional file awaiting validation
#[derive(Debug)]
pub struct Candidate {
    path: PathBuf,
    active: PathBuf,
    armed: bool,
}

impl Candidate {
    pub fn for_active(active: &Path) -> Self {
        Self {
            path: candidate_path(active),
            active: active.to_path_buf(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active(&self) -> &Path {
        &self.active
    }

    /// Atomically replace the active file with this candidate.
    ///
    /// The rename is the only mutation of the active file. If it fails the
    /// active file is still the previous, complete version.
    pub fn commit(mut self) -> Result<(), SyncError> {
        replace_file(&self.path, &self.active)?;
        self.armed = false;
        debug!("Committed {}", self.active.display());
        Ok(())
    }

    /// Leave the candidate on disk for someone else to swap in
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        self.path.clone()
    }

    /// Delete the candidate now instead of on drop
    pub fn discard(self) {}
}

impl Drop for Candidate {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed candidate {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove candidate {}: {}", self.path.display(), e),
        }
    }
}

/// Rename `from` over `to`.
///
/// Rename replaces the target atomically on unix. Windows refuses in a few
/// cases (for example a target held open without share-delete), so there the
/// target is removed first and the rename retried.
pub fn replace_file(from: &Path, to: &Path) -> Result<(), SyncError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(first) if cfg!(windows) && to.exists() => {
            debug!("Rename over {} failed ({}), removing target first", to.display(), first);
            fs::remove_file(to).map_err(|source| SyncError::Commit {
                path: to.to_path_buf(),
                source,
            })?;
            fs::rename(from, to).map_err(|source| SyncError::Commit {
                path: to.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(SyncError::Commit {
            path: to.to_path_buf(),
            source,
        }),
    }
}
