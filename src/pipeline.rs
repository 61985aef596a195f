//! Configuration loading and plugin initialization
//!
//! The same pipeline runs at agent startup and against every candidate
//! configuration, so anything that would stop the agent from starting also
//! stops a candidate from being committed.

use crate::config::{load_config, AgentFileConfig};
use crate::inputs::{build_inputs, Input};
use crate::metrics::Metric;
use crate::sync::client::SyncClient;
use crate::sync::SyncSettings;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A fully initialized agent, minus the running loop
pub struct Pipeline {
    config_path: PathBuf,
    config: AgentFileConfig,
    inputs: Vec<Box<dyn Input>>,
    hostname: String,
    client: Option<SyncClient>,
}

impl Pipeline {
    /// Parse `path` and build every configured plugin
    pub fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;

        let inputs = build_inputs(&config.inputs).context("Failed to initialize inputs")?;

        let client = config
            .outputs
            .http
            .as_ref()
            .map(|http| SyncClient::from_config(http, config.agent.data_format))
            .transpose()
            .context("Failed to initialize outputs.http")?;

        let hostname = if config.agent.hostname.is_empty() {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default()
        } else {
            config.agent.hostname.clone()
        };

        debug!(
            "Loaded {} with {} input(s)",
            path.display(),
            inputs.len()
        );

        Ok(Self {
            config_path: path.to_path_buf(),
            config,
            inputs,
            hostname,
            client,
        })
    }

    pub fn config(&self) -> &AgentFileConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Settings for the sync cycle, or `None` when there is no HTTP output
    pub fn sync_settings(&self) -> Option<SyncSettings> {
        self.config
            .outputs
            .http
            .as_ref()
            .map(|http| SyncSettings::from_config(&self.config_path, http))
    }

    /// Hand the HTTP client to the sync layer
    pub fn take_client(&mut self) -> Option<SyncClient> {
        self.client.take()
    }

    /// Run every input once. A failing input is logged and skipped.
    pub fn gather(&mut self) -> Vec<Metric> {
        let mut metrics = Vec::new();
        for input in &mut self.inputs {
            match input.gather() {
                Ok(gathered) => metrics.extend(gathered),
                Err(e) => warn!("Input {} failed: {:#}", input.name(), e),
            }
        }

        for metric in &mut metrics {
            if !self.config.agent.omit_hostname && !self.hostname.is_empty() {
                metric.add_default_tag("host", &self.hostname);
            }
            for (key, value) in &self.config.global_tags {
                metric.add_default_tag(key, value);
            }
        }
        metrics
    }
}
