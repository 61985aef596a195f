//! Configuration management for syncagent
//!
//! The agent reads a single TOML file. Its `[[inputs.*]]` tables live in the
//! managed section that the control server may rewrite; everything else
//! (`[agent]`, `[outputs.http]`) is owned by the operator.
//!
//! # Example
//!
//! ```toml
//! [agent]
//!   interval = 10
//!   flush_interval = 10
//!
//! [outputs.http]
//!   url = "https://bridge.example.com/telegraf"
//!   source_address = "web-01"
//!   content_encoding = "gzip"
//!
//! ###############################################################################
//! #                            INPUT PLUGINS                                    #
//! ###############################################################################
//!
//! [[inputs.cpu]]
//!   percpu = false
//!
//! ###############################################################################
//! ```

use crate::metrics::DataFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Control endpoint used when none is configured
pub const DEFAULT_URL: &str = "http://127.0.0.1:8080/telegraf";

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/syncagent/syncagent.conf";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentFileConfig {
    /// Tags added to every metric
    #[serde(default)]
    pub global_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub outputs: OutputsSection,
    /// Input plugin tables keyed by plugin name, one entry per `[[inputs.<name>]]`
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<toml::Value>>,
}

/// `[agent]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Seconds between input gathers
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Seconds between flushes; every flush runs one sync cycle
    #[serde(default = "default_interval")]
    pub flush_interval: u64,
    /// Maximum buffered metrics kept while the endpoint is unreachable
    #[serde(default = "default_metric_buffer_limit")]
    pub metric_buffer_limit: usize,
    /// Override for the `host` tag (default: system host name)
    #[serde(default)]
    pub hostname: String,
    /// Do not add a `host` tag
    #[serde(default)]
    pub omit_hostname: bool,
    /// Serialization format of the metric batch
    #[serde(default)]
    pub data_format: DataFormat,
    /// Port for the /health, /status and /metrics endpoints
    #[serde(default)]
    pub status_port: Option<u16>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            flush_interval: default_interval(),
            metric_buffer_limit: default_metric_buffer_limit(),
            hostname: String::new(),
            omit_hostname: false,
            data_format: DataFormat::default(),
            status_port: None,
        }
    }
}

/// `[outputs]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputsSection {
    #[serde(default)]
    pub http: Option<HttpOutputConfig>,
}

/// Body encoding of the poll request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

/// How a candidate configuration is test-loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Build a fresh pipeline inside this process
    #[default]
    InProcess,
    /// Run `<exe> --config <candidate> test` in a child process
    Subprocess,
}

/// How the agent restarts itself after an apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategyKind {
    /// In-place re-exec where the platform supports it, service manager otherwise
    #[default]
    Auto,
    InPlace,
    Service,
}

/// `[outputs.http]` table: metric delivery and the sync protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpOutputConfig {
    /// Poll URL; binary updates are fetched from this URL with `Update` appended
    #[serde(default = "default_url")]
    pub url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// POST or PUT
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Additional request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// OAuth2 client credentials grant
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub content_encoding: ContentEncoding,
    /// Instance identity reported as `source` (default: host name)
    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// File whose managed section is synced (default: this configuration file)
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    /// Revision marker (default: `syncagent-revision` next to the config file)
    #[serde(default)]
    pub revision_file: Option<PathBuf>,
    #[serde(default)]
    pub start_sentinel: Option<String>,
    #[serde(default)]
    pub end_sentinel: Option<String>,
    #[serde(default = "default_true")]
    pub skip_border: bool,
    #[serde(default)]
    pub validation: ValidationMode,
    /// Seconds a subprocess validation may take
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: u64,
    #[serde(default)]
    pub restart_strategy: RestartStrategyKind,
    /// Service unit restarted by the service-manager strategy
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Script that swaps in a downloaded binary after exit (Windows)
    #[serde(default)]
    pub update_helper: Option<PathBuf>,
    /// Run `<new binary> --version` before installing it
    #[serde(default = "default_true")]
    pub verify_binary: bool,
}

impl Default for HttpOutputConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout: default_timeout(),
            method: default_method(),
            username: None,
            password: None,
            headers: BTreeMap::new(),
            client_id: None,
            client_secret: None,
            token_url: None,
            scopes: Vec::new(),
            content_encoding: ContentEncoding::default(),
            source_address: None,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            insecure_skip_verify: false,
            config_file: None,
            revision_file: None,
            start_sentinel: None,
            end_sentinel: None,
            skip_border: true,
            validation: ValidationMode::default(),
            validation_timeout: default_validation_timeout(),
            restart_strategy: RestartStrategyKind::default(),
            service_name: default_service_name(),
            update_helper: None,
            verify_binary: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    10
}

fn default_metric_buffer_limit() -> usize {
    10_000
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_validation_timeout() -> u64 {
    30
}

fn default_service_name() -> String {
    "syncagent".to_string()
}

impl AgentFileConfig {
    /// Check values serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.agent.interval == 0 {
            return Err(anyhow::anyhow!("agent.interval must be greater than 0"));
        }
        if self.agent.flush_interval == 0 {
            return Err(anyhow::anyhow!("agent.flush_interval must be greater than 0"));
        }
        if self.agent.metric_buffer_limit == 0 {
            return Err(anyhow::anyhow!(
                "agent.metric_buffer_limit must be greater than 0"
            ));
        }

        if let Some(http) = &self.outputs.http {
            http.validate()?;
        }
        Ok(())
    }
}

impl HttpOutputConfig {
    pub fn validate(&self) -> Result<()> {
        let method = self.method.to_uppercase();
        if method != "POST" && method != "PUT" {
            return Err(anyhow::anyhow!(
                "invalid method [{}] {}, expected POST or PUT",
                self.url,
                self.method
            ));
        }

        reqwest::Url::parse(&self.url)
            .with_context(|| format!("invalid outputs.http.url: {}", self.url))?;

        if self.timeout == 0 {
            return Err(anyhow::anyhow!("outputs.http.timeout must be greater than 0"));
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(anyhow::anyhow!(
                "outputs.http.tls_cert and outputs.http.tls_key must be set together"
            ));
        }

        if let Some(start) = &self.start_sentinel {
            if start.trim().is_empty() {
                return Err(anyhow::anyhow!("outputs.http.start_sentinel must not be blank"));
            }
        }
        if let Some(end) = &self.end_sentinel {
            if end.trim().is_empty() {
                return Err(anyhow::anyhow!("outputs.http.end_sentinel must not be blank"));
            }
        }

        Ok(())
    }

    /// OAuth2 is used only when all three credentials are present
    pub fn oauth2_enabled(&self) -> bool {
        [&self.client_id, &self.client_secret, &self.token_url]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

/// Parse configuration text
pub fn parse_config(contents: &str) -> Result<AgentFileConfig> {
    let config: AgentFileConfig =
        toml::from_str(contents).context("Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the configuration file at `path`
pub fn load_config(path: &Path) -> Result<AgentFileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Resolve the configuration file with the usual precedence:
/// 1. CLI argument if provided
/// 2. System-wide config (/etc/syncagent/syncagent.conf) if it exists
/// 3. User config (~/.config/syncagent/syncagent.conf)
pub fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.unwrap_or_else(|| {
        let system_config = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            system_config
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("syncagent")
                .join("syncagent.conf")
        }
    })
}
