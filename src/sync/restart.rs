//! Restarting the agent after an apply
//!
//! Two strategies exist. `InPlace` re-executes the current binary with the
//! same arguments and environment (unix only). `ServiceManager` asks the init
//! system to restart the unit and returns without waiting. The strategy is
//! picked once at startup; once a restart has been requested no further sync
//! cycles run in this process.

use crate::config::RestartStrategyKind;
use crate::sync::error::SyncError;
use crate::sync::revision::Revision;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Why the agent is restarting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    ConfigApplied(Revision),
    BinaryInstalled(Revision),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ConfigApplied(rev) => write!(f, "configuration revision {} applied", rev),
            RestartReason::BinaryInstalled(rev) => write!(f, "binary revision {} installed", rev),
        }
    }
}

/// Init systems the agent knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    Systemd,
    SysVinit,
    OpenRc,
    Runit,
    WindowsScm,
}

impl ServiceManager {
    /// Find the first available service manager on this host
    pub fn detect() -> Option<Self> {
        if cfg!(windows) {
            return Some(ServiceManager::WindowsScm);
        }

        let candidates = [
            ("systemctl", ServiceManager::Systemd),
            ("rc-service", ServiceManager::OpenRc),
            ("sv", ServiceManager::Runit),
            ("service", ServiceManager::SysVinit),
        ];

        candidates.into_iter().find_map(|(binary, manager)| {
            Command::new("which")
                .arg(binary)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
                .then_some(manager)
        })
    }

    /// Command line that restarts `service`
    pub fn restart_command(&self, service: &str) -> Vec<String> {
        let args = match self {
            ServiceManager::Systemd => vec!["systemctl", "restart", service],
            ServiceManager::SysVinit => vec!["service", service, "restart"],
            ServiceManager::OpenRc => vec!["rc-service", service, "restart"],
            ServiceManager::Runit => vec!["sv", "restart", service],
            ServiceManager::WindowsScm => {
                return vec![
                    "cmd".to_string(),
                    "/C".to_string(),
                    format!("net stop {0} & net start {0}", service),
                ]
            }
        };
        args.into_iter().map(String::from).collect()
    }
}

/// Restart strategy chosen at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartStrategy {
    InPlace,
    ServiceManager { manager: ServiceManager, service: String },
}

impl RestartStrategy {
    pub fn select(kind: RestartStrategyKind, service: &str) -> Self {
        let service_manager = || {
            let manager = ServiceManager::detect().unwrap_or_else(|| {
                warn!("No service manager found, assuming systemd");
                ServiceManager::Systemd
            });
            RestartStrategy::ServiceManager {
                manager,
                service: service.to_string(),
            }
        };

        match kind {
            RestartStrategyKind::InPlace if cfg!(unix) => RestartStrategy::InPlace,
            RestartStrategyKind::InPlace => {
                warn!("In-place restart is not supported on this platform, using the service manager");
                service_manager()
            }
            RestartStrategyKind::Service => service_manager(),
            RestartStrategyKind::Auto if cfg!(unix) => RestartStrategy::InPlace,
            RestartStrategyKind::Auto => service_manager(),
        }
    }
}

/// Performs the restart that follows a successful apply
#[async_trait]
pub trait Restarter: Send + Sync {
    /// Returns once the restart has been handed off. An in-place restart
    /// does not return on success.
    async fn restart(&self, reason: &RestartReason) -> Result<(), SyncError>;
}

/// Restarts the running agent process
pub struct ProcessRestarter {
    strategy: RestartStrategy,
    exe: PathBuf,
    update_helper: Option<PathBuf>,
}

impl ProcessRestarter {
    /// `exe` must be resolved before any binary is installed; on Linux the
    /// running image's path reads as "(deleted)" once it has been replaced.
    pub fn new(strategy: RestartStrategy, exe: PathBuf, update_helper: Option<PathBuf>) -> Self {
        Self {
            strategy,
            exe,
            update_helper,
        }
    }

    pub fn strategy(&self) -> &RestartStrategy {
        &self.strategy
    }

    fn spawn_detached(args: &[String]) -> Result<(), SyncError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| SyncError::Restart("empty restart command".to_string()))?;
        Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| SyncError::Restart(format!("failed to run {}: {}", args.join(" "), e)))
    }

    #[cfg(unix)]
    fn reexec(&self) -> Result<(), SyncError> {
        use std::os::unix::process::CommandExt;

        let args: Vec<_> = std::env::args_os().skip(1).collect();
        info!("Re-executing {}", self.exe.display());
        let err = Command::new(&self.exe).args(&args).exec();
        Err(SyncError::Restart(format!(
            "exec {} failed: {}",
            self.exe.display(),
            err
        )))
    }

    #[cfg(not(unix))]
    fn reexec(&self) -> Result<(), SyncError> {
        Err(SyncError::Restart(format!(
            "in-place restart of {} is not supported on this platform",
            self.exe.display()
        )))
    }
}

#[async_trait]
impl Restarter for ProcessRestarter {
    async fn restart(&self, reason: &RestartReason) -> Result<(), SyncError> {
        info!("Restarting: {}", reason);

        // The downloaded binary is swapped in by the helper once we are gone
        if cfg!(windows) && matches!(reason, RestartReason::BinaryInstalled(_)) {
            let helper = self
                .update_helper
                .as_ref()
                .ok_or_else(|| SyncError::Restart("no update helper configured".to_string()))?;
            return Self::spawn_detached(&[
                "cmd".to_string(),
                "/C".to_string(),
                helper.display().to_string(),
            ]);
        }

        match &self.strategy {
            RestartStrategy::InPlace => self.reexec(),
            RestartStrategy::ServiceManager { manager, service } => {
                let command = manager.restart_command(service);
                info!("Running {}", command.join(" "));
                Self::spawn_detached(&command)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_commands() {
        assert_eq!(
            ServiceManager::Systemd.restart_command("syncagent"),
            vec!["systemctl", "restart", "syncagent"]
        );
        assert_eq!(
            ServiceManager::SysVinit.restart_command("syncagent"),
            vec!["service", "syncagent", "restart"]
        );
        assert_eq!(
            ServiceManager::Runit.restart_command("syncagent"),
            vec!["sv", "restart", "syncagent"]
        );
        assert_eq!(
            ServiceManager::WindowsScm.restart_command("syncagent"),
            vec!["cmd", "/C", "net stop syncagent & net start syncagent"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_auto_is_in_place_on_unix() {
        assert_eq!(
            RestartStrategy::select(RestartStrategyKind::Auto, "syncagent"),
            RestartStrategy::InPlace
        );
        assert_eq!(
            RestartStrategy::select(RestartStrategyKind::InPlace, "syncagent"),
            RestartStrategy::InPlace
        );
    }

    #[test]
    fn test_service_strategy_keeps_name() {
        match RestartStrategy::select(RestartStrategyKind::Service, "metrics-agent") {
            RestartStrategy::ServiceManager { service, .. } => assert_eq!(service, "metrics-agent"),
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_reason_display() {
        let reason = RestartReason::ConfigApplied(Revision::new("12"));
        assert_eq!(reason.to_string(), "configuration revision 12 applied");
    }
}
