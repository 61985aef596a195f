//! Remote configuration sync and self-update
//!
//! Every metric flush runs one sync cycle:
//!
//! ```text
//! fingerprint -> poll -> NoChange
//!                     -> ConfigAvailable -> splice -> validate -> commit -> restart
//!                                                              -> reject
//!                     -> BinaryAvailable -> fetch -> install -> restart
//!                                                 -> no real update
//! ```
//!
//! Nothing before the commit step mutates the active configuration file, and
//! every failure before it leaves the agent running on its current
//! configuration. The cycle for a given file is single-flight.

pub mod auth;
pub mod candidate;
pub mod client;
pub mod error;
pub mod fingerprint;
pub mod install;
pub mod lock;
pub mod restart;
pub mod revision;
pub mod section;
pub mod validate;

use crate::config::{HttpOutputConfig, RestartStrategyKind, ValidationMode};
use anyhow::{Context, Result};
use client::{PollResponse, SyncClient};
use error::SyncError;
use fingerprint::{Fingerprint, Fingerprinter};
use install::BinaryInstaller;
use restart::{ProcessRestarter, RestartReason, RestartStrategy, Restarter};
use revision::{Revision, RevisionStore, DEFAULT_REVISION_FILE};
use section::{SectionEditor, SentinelEditor, Sentinels};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validate::{CommandValidator, ConfigValidator, PipelineValidator};

/// Default update helper, looked up next to the configuration file
pub const DEFAULT_UPDATE_HELPER: &str = "update.bat";

/// Everything the sync cycle needs from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub config_path: PathBuf,
    pub revision_file: PathBuf,
    pub sentinels: Sentinels,
    pub validation: ValidationMode,
    pub validation_timeout: Duration,
    pub restart_strategy: RestartStrategyKind,
    pub service_name: String,
    pub update_helper: PathBuf,
    pub verify_binary: bool,
}

impl SyncSettings {
    /// Resolve `[outputs.http]` against the file it was loaded from
    pub fn from_config(loaded_from: &Path, http: &HttpOutputConfig) -> Self {
        let config_path = http
            .config_file
            .clone()
            .unwrap_or_else(|| loaded_from.to_path_buf());
        let config_dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let defaults = Sentinels::default();
        Self {
            revision_file: http
                .revision_file
                .clone()
                .unwrap_or_else(|| config_dir.join(DEFAULT_REVISION_FILE)),
            sentinels: Sentinels {
                start: http.start_sentinel.clone().unwrap_or(defaults.start),
                end: http.end_sentinel.clone().unwrap_or(defaults.end),
                skip_border: http.skip_border,
            },
            validation: http.validation,
            validation_timeout: Duration::from_secs(http.validation_timeout),
            restart_strategy: http.restart_strategy,
            service_name: http.service_name.clone(),
            update_helper: http
                .update_helper
                .clone()
                .unwrap_or_else(|| config_dir.join(DEFAULT_UPDATE_HELPER)),
            verify_binary: http.verify_binary,
            config_path,
        }
    }
}

/// Terminal state of a cycle that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Server has nothing new
    NoChange,
    /// Another cycle holds the file, or a restart is already under way
    Skipped,
    /// Server announced a binary but had none for this revision
    NoRealUpdate,
    /// A new configuration or binary went live and the restart was handed off
    Restarting(RestartReason),
}

/// Result of one cycle
#[derive(Debug)]
pub struct CycleReport {
    /// The poll carrying the metric batch was answered by the server
    pub delivered: bool,
    pub outcome: Result<SyncOutcome, SyncError>,
}

impl CycleReport {
    fn undelivered(outcome: Result<SyncOutcome, SyncError>) -> Self {
        Self {
            delivered: false,
            outcome,
        }
    }

    pub fn is_restarting(&self) -> bool {
        matches!(self.outcome, Ok(SyncOutcome::Restarting(_)))
    }
}

/// Drives sync cycles for one configuration file
pub struct Synchronizer {
    settings: SyncSettings,
    client: SyncClient,
    editor: Arc<dyn SectionEditor>,
    fingerprinter: Fingerprinter,
    validator: Box<dyn ConfigValidator>,
    installer: BinaryInstaller,
    restarter: Arc<dyn Restarter>,
    store: RevisionStore,
    revision: Option<Revision>,
    last_fingerprint: Option<Fingerprint>,
    restarting: bool,
}

impl Synchronizer {
    /// Build the synchronizer and read the stored revision once
    pub fn new(settings: SyncSettings, client: SyncClient) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;

        let editor: Arc<dyn SectionEditor> =
            Arc::new(SentinelEditor::new(settings.sentinels.clone()));

        let validator: Box<dyn ConfigValidator> = match settings.validation {
            ValidationMode::InProcess => Box::new(PipelineValidator),
            ValidationMode::Subprocess => Box::new(CommandValidator::for_exe(
                exe.clone(),
                settings.validation_timeout,
            )),
        };

        let strategy = RestartStrategy::select(settings.restart_strategy, &settings.service_name);
        info!("Restart strategy: {:?}", strategy);
        let restarter = Arc::new(ProcessRestarter::new(
            strategy,
            exe.clone(),
            Some(settings.update_helper.clone()),
        ));

        let store = RevisionStore::new(settings.revision_file.clone());
        let revision = store.load().context("Failed to read the revision marker")?;

        Ok(Self {
            fingerprinter: Fingerprinter::new(editor.clone()),
            editor,
            validator,
            installer: BinaryInstaller::new(exe, settings.verify_binary),
            restarter,
            store,
            revision,
            last_fingerprint: None,
            restarting: false,
            client,
            settings,
        })
    }

    pub fn with_validator(mut self, validator: Box<dyn ConfigValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = restarter;
        self
    }

    /// Install binaries at `exe` instead of the running executable
    pub fn with_installer(mut self, installer: BinaryInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    /// Revision reported to the server
    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    /// Fingerprint computed by the most recent cycle
    pub fn last_fingerprint(&self) -> Option<&Fingerprint> {
        self.last_fingerprint.as_ref()
    }

    /// Fingerprint of the managed section as it is on disk now
    pub fn fingerprint(&self) -> Result<Fingerprint, SyncError> {
        self.fingerprinter.fingerprint(&self.settings.config_path)
    }

    /// Run one cycle with `payload` as the poll body
    #[instrument(skip_all, fields(config = %self.settings.config_path.display()))]
    pub async fn run_cycle(&mut self, payload: &[u8]) -> CycleReport {
        if self.restarting {
            return CycleReport::undelivered(Ok(SyncOutcome::Skipped));
        }

        let _guard = match lock::try_acquire(&self.settings.config_path) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Another sync cycle holds the configuration file, skipping");
                return CycleReport::undelivered(Ok(SyncOutcome::Skipped));
            }
            Err(e) => return CycleReport::undelivered(Err(e)),
        };

        let fingerprint = match self.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) => return CycleReport::undelivered(Err(e)),
        };
        self.last_fingerprint = Some(fingerprint.clone());

        let response = match self
            .client
            .poll(payload, &fingerprint, self.revision.as_ref())
            .await
        {
            Ok(response) => response,
            Err(e) => return CycleReport::undelivered(Err(e)),
        };

        let outcome = match response {
            PollResponse::NoChange => Ok(SyncOutcome::NoChange),
            PollResponse::ConfigAvailable { content, revision } => {
                self.apply_config(&fingerprint, content, revision).await
            }
            PollResponse::BinaryAvailable => self.apply_binary().await,
        };

        CycleReport {
            delivered: true,
            outcome,
        }
    }

    async fn apply_config(
        &mut self,
        current: &Fingerprint,
        content: String,
        revision: Option<Revision>,
    ) -> Result<SyncOutcome, SyncError> {
        let offered = Fingerprint::of_content(&content);
        if &offered == current {
            debug!("Offered configuration matches the managed section, nothing to apply");
            return Ok(SyncOutcome::NoChange);
        }

        let revision = revision.unwrap_or_else(|| Revision::new(offered.as_str()));
        info!("New configuration available (revision {})", revision);

        if let Err(reason) = self.editor.check_content(&content) {
            warn!("Rejected configuration revision {}: {}", revision, reason);
            return Err(SyncError::Rejected(reason));
        }

        let candidate =
            self.editor
                .splice(&self.settings.config_path, &content, revision.as_str())?;

        if let Err(reason) = self.validator.validate(candidate.path()).await {
            warn!("Rejected configuration revision {}: {}", revision, reason);
            candidate.discard();
            return Err(SyncError::Rejected(reason));
        }

        candidate.commit()?;
        info!(
            "Configuration revision {} committed to {}",
            revision,
            self.settings.config_path.display()
        );

        self.restart(RestartReason::ConfigApplied(revision)).await
    }

    async fn apply_binary(&mut self) -> Result<SyncOutcome, SyncError> {
        info!("New agent binary available");
        let Some(staged) = self
            .installer
            .stage(&self.client, self.revision.as_ref())
            .await?
        else {
            return Ok(SyncOutcome::NoRealUpdate);
        };
        let revision = staged.revision().clone();

        // Marker first: if it cannot be written the running binary is untouched
        self.store.store(&revision)?;
        if let Err(e) = staged.install() {
            self.restore_revision();
            return Err(e);
        }
        self.revision = Some(revision.clone());

        self.restart(RestartReason::BinaryInstalled(revision)).await
    }

    /// Put the marker back to the revision of the binary still in place
    fn restore_revision(&self) {
        let restored = match &self.revision {
            Some(previous) => self.store.store(previous),
            None => self.store.clear(),
        };
        if let Err(e) = restored {
            error!("Failed to restore the revision marker: {}", e);
        }
    }

    async fn restart(&mut self, reason: RestartReason) -> Result<SyncOutcome, SyncError> {
        self.restarting = true;
        self.restarter.restart(&reason).await?;
        Ok(SyncOutcome::Restarting(reason))
    }
}
