//! Binary self-update
//!
//! The replacement binary is streamed into `<exe>.new` next to the running
//! executable. On unix it is renamed over the running file, which the kernel
//! allows; the old image stays mapped until the process re-executes. On
//! Windows the running executable cannot be replaced, so `<exe>.new` is left
//! for the update helper to swap in after the agent has stopped.

use crate::sync::candidate::Candidate;
use crate::sync::client::SyncClient;
use crate::sync::error::{RejectionReason, SyncError};
use crate::sync::revision::Revision;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads and installs agent binaries
pub struct BinaryInstaller {
    exe: PathBuf,
    verify: bool,
}

/// A downloaded binary waiting next to the executable it will replace.
///
/// Dropping it without calling [`StagedBinary::install`] removes the download.
pub struct StagedBinary {
    artifact: Candidate,
    revision: Revision,
}

impl StagedBinary {
    /// The `X-Revision` header when the server sent one, otherwise the MD5 of
    /// the artifact
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    /// Put the binary in place: a rename over the running executable on unix,
    /// a hand-off to the update helper on Windows
    pub fn install(self) -> Result<(), SyncError> {
        if cfg!(windows) {
            let path = self.artifact.keep();
            info!(
                "Binary revision {} staged at {}, the update helper will install it",
                self.revision,
                path.display()
            );
        } else {
            self.artifact.commit()?;
            info!("Binary revision {} installed", self.revision);
        }
        Ok(())
    }
}

impl BinaryInstaller {
    pub fn new(exe: PathBuf, verify: bool) -> Self {
        Self { exe, verify }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Fetch the binary for `revision` into `<exe>.new` and check it runs.
    ///
    /// `Ok(None)` means the server had no real update. Nothing outside the
    /// staged file is touched.
    #[instrument(skip(self, client), fields(exe = %self.exe.display()))]
    pub async fn stage(
        &self,
        client: &SyncClient,
        revision: Option<&Revision>,
    ) -> Result<Option<StagedBinary>, SyncError> {
        let Some(download) = client.fetch_update(revision).await? else {
            return Ok(None);
        };

        let announced = download.revision().cloned();
        let artifact = Candidate::for_active(&self.exe);
        let digest = download.write_to(artifact.path()).await?;
        let revision = announced.unwrap_or_else(|| Revision::new(digest));

        make_executable(artifact.path())?;
        if self.verify {
            verify_artifact(artifact.path()).await?;
        }

        Ok(Some(StagedBinary { artifact, revision }))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| SyncError::io("failed to make executable", path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SyncError> {
    Ok(())
}

/// Make sure the download is a binary this host can run
async fn verify_artifact(path: &Path) -> Result<(), SyncError> {
    let output = tokio::time::timeout(
        VERIFY_TIMEOUT,
        tokio::process::Command::new(path)
            .arg("--version")
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let reason = match output {
        Ok(Ok(output)) if output.status.success() => {
            info!(
                "Downloaded binary reports {}",
                String::from_utf8_lossy(&output.stdout).trim()
            );
            return Ok(());
        }
        Ok(Ok(output)) => format!("downloaded binary exited with {}", output.status),
        Ok(Err(e)) => format!("downloaded binary failed to run: {}", e),
        Err(_) => format!(
            "downloaded binary did not answer --version within {}s",
            VERIFY_TIMEOUT.as_secs()
        ),
    };
    Err(SyncError::Rejected(RejectionReason(reason)))
}
