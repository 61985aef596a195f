//! Candidate validation
//!
//! A candidate only replaces the active configuration after it has been
//! loaded through the same pipeline the agent uses at startup. Collection is
//! never started.

use crate::pipeline::Pipeline;
use crate::sync::error::RejectionReason;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Decides whether a candidate configuration may go live
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self, candidate: &Path) -> Result<(), RejectionReason>;
}

/// Loads the candidate in this process
pub struct PipelineValidator;

#[async_trait]
impl ConfigValidator for PipelineValidator {
    async fn validate(&self, candidate: &Path) -> Result<(), RejectionReason> {
        let candidate = candidate.to_path_buf();
        let pipeline = tokio::task::spawn_blocking(move || Pipeline::load(&candidate))
            .await
            .map_err(|e| RejectionReason(format!("validation task failed: {}", e)))??;
        debug!(
            "Candidate loaded with {} input(s)",
            pipeline.input_count()
        );
        Ok(())
    }
}

/// Runs `<program> [prefix args] --config <candidate> test` and accepts the
/// candidate when it exits successfully
pub struct CommandValidator {
    program: PathBuf,
    prefix: Vec<OsString>,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(program: PathBuf, prefix: Vec<OsString>, timeout: Duration) -> Self {
        Self {
            program,
            prefix,
            timeout,
        }
    }

    /// Validate with this very binary
    pub fn for_exe(exe: PathBuf, timeout: Duration) -> Self {
        Self::new(exe, Vec::new(), timeout)
    }
}

#[async_trait]
impl ConfigValidator for CommandValidator {
    async fn validate(&self, candidate: &Path) -> Result<(), RejectionReason> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.prefix)
            .arg("--config")
            .arg(candidate)
            .arg("test")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RejectionReason(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(RejectionReason(format!(
                    "validation did not finish within {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        if detail.is_empty() {
            Err(RejectionReason(format!("validation exited with {}", output.status)))
        } else {
            Err(RejectionReason(detail.to_string()))
        }
    }
}
