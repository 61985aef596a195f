//! Error taxonomy for the sync cycle.
//!
//! Every failure below the commit step is local to one cycle: the agent keeps
//! shipping metrics with its current configuration and the next flush retries.

use std::path::PathBuf;
use thiserror::Error;

/// Why a candidate configuration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionReason(pub String);

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<anyhow::Error> for RejectionReason {
    fn from(err: anyhow::Error) -> Self {
        // Keep the whole context chain, the innermost cause is usually the useful part
        Self(format!("{:#}", err))
    }
}

/// Coarse class of a [`SyncError`], used by callers to decide how loudly to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Content,
    LocalIo,
    FatalApply,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("control endpoint returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("request to control endpoint failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oauth2 token request failed: {0}")]
    Token(String),

    #[error("failed to encode request body: {0}")]
    Encode(#[source] std::io::Error),

    #[error("candidate configuration rejected: {0}")]
    Rejected(RejectionReason),

    #[error("{action} {}: {source}", path.display())]
    LocalIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to commit {}: {source}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("restart failed after apply: {0}")]
    Restart(String),
}

impl SyncError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::LocalIo {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Status { .. } | SyncError::Http(_) | SyncError::Token(_) => {
                ErrorKind::Transport
            }
            SyncError::Rejected(_) => ErrorKind::Content,
            SyncError::LocalIo { .. } | SyncError::Encode(_) => ErrorKind::LocalIo,
            SyncError::Commit { .. } | SyncError::Restart(_) => ErrorKind::FatalApply,
        }
    }
}
