//! Single-flight discipline for sync cycles
//!
//! At most one cycle may run per configuration file. Inside the process this
//! is an async mutex per canonical path; across processes an advisory `flock`
//! on `<config>.lock` keeps a second agent instance (or an operator running
//! `syncagent agent --once`) from splicing the same file concurrently.

use crate::sync::error::SyncError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

static FILE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Held for the whole fingerprint → commit/reject span of one cycle
pub struct SingleFlightGuard {
    _local: OwnedMutexGuard<()>,
    #[cfg(unix)]
    _file: nix::fcntl::Flock<std::fs::File>,
}

fn lock_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(unix)]
fn lock_file_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Try to take the single-flight lock for `path`.
///
/// Returns `Ok(None)` when another cycle already holds it; the caller skips
/// this cycle instead of queueing behind it.
pub fn try_acquire(path: &Path) -> Result<Option<SingleFlightGuard>, SyncError> {
    let mutex = {
        let mut locks = FILE_LOCKS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(lock_key(path))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    };

    let local = match mutex.try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => return Ok(None),
    };

    #[cfg(unix)]
    {
        use nix::fcntl::{Flock, FlockArg};

        let lock_path = lock_file_path(path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| SyncError::io("failed to open lock file", &lock_path, e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => Ok(Some(SingleFlightGuard {
                _local: local,
                _file: file,
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(SyncError::io(
                "failed to lock",
                &lock_path,
                std::io::Error::from(errno),
            )),
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(SingleFlightGuard { _local: local }))
    }
}
