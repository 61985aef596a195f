//! Agent mode implementation
//!
//! The event loop gathers inputs every `interval` and flushes every
//! `flush_interval`. A flush serializes the buffered metrics and sends them
//! as the body of one sync cycle; the flush waits for the cycle to finish.
//! Metrics stay buffered until the control endpoint has answered a poll.

use crate::metrics::{DataFormat, Metric};
use crate::pipeline::Pipeline;
use crate::status::SyncStatus;
use crate::sync::error::ErrorKind;
use crate::sync::restart::RestartReason;
use crate::sync::{SyncOutcome, Synchronizer};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Why the event loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    Shutdown,
    Restart(RestartReason),
}

/// Runs inputs and the sync cycle
pub struct Agent {
    pipeline: Pipeline,
    synchronizer: Synchronizer,
    buffer: VecDeque<Metric>,
    buffer_limit: usize,
    data_format: DataFormat,
    gather_interval: Duration,
    flush_interval: Duration,
    status: Arc<SyncStatus>,
}

impl Agent {
    /// Build an agent from a loaded pipeline
    pub fn new(mut pipeline: Pipeline) -> Result<Self> {
        let settings = pipeline
            .sync_settings()
            .context("No [outputs.http] configured, nothing to send metrics to")?;
        let client = pipeline
            .take_client()
            .context("HTTP client was already taken")?;
        let synchronizer = Synchronizer::new(settings, client)?;
        Self::with_synchronizer(pipeline, synchronizer)
    }

    /// Build an agent around an existing synchronizer
    pub fn with_synchronizer(pipeline: Pipeline, synchronizer: Synchronizer) -> Result<Self> {
        let agent = &pipeline.config().agent;
        Ok(Self {
            buffer: VecDeque::new(),
            buffer_limit: agent.metric_buffer_limit,
            data_format: agent.data_format,
            gather_interval: Duration::from_secs(agent.interval),
            flush_interval: Duration::from_secs(agent.flush_interval),
            status: Arc::new(SyncStatus::new()?),
            pipeline,
            synchronizer,
        })
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        self.status.clone()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Run inputs once and buffer the result, dropping the oldest metrics
    /// when the buffer is full
    pub fn gather(&mut self) {
        let metrics = self.pipeline.gather();
        debug!("Gathered {} metric(s)", metrics.len());
        self.buffer.extend(metrics);

        let overflow = self.buffer.len().saturating_sub(self.buffer_limit);
        if overflow > 0 {
            warn!(
                "Metric buffer full, dropping {} oldest metric(s)",
                overflow
            );
            self.buffer.drain(..overflow);
        }
        self.status.set_buffered(self.buffer.len());
    }

    /// Send the buffered metrics and run one sync cycle.
    ///
    /// Returns the restart reason when the cycle applied an update.
    #[instrument(skip(self), fields(buffered = self.buffer.len()))]
    pub async fn flush(&mut self) -> Option<RestartReason> {
        let payload = match self.data_format.serialize(self.buffer.make_contiguous()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize metrics: {:#}", e);
                return None;
            }
        };

        let report = self.synchronizer.run_cycle(&payload).await;
        if report.delivered {
            debug!("Delivered {} metric(s)", self.buffer.len());
            self.buffer.clear();
        }
        self.status.set_buffered(self.buffer.len());
        self.status.record_cycle(
            &report,
            self.synchronizer.revision().map(|r| r.to_string()),
            self.synchronizer.last_fingerprint().map(|f| f.to_string()),
        );

        match report.outcome {
            Ok(SyncOutcome::NoChange) => debug!("Configuration is up to date"),
            Ok(SyncOutcome::Skipped) => debug!("Sync cycle skipped"),
            Ok(SyncOutcome::NoRealUpdate) => info!("Server announced an update but had none"),
            Ok(SyncOutcome::Restarting(reason)) => return Some(reason),
            Err(e) => match e.kind() {
                ErrorKind::Transport => warn!("Control endpoint unavailable: {}", e),
                ErrorKind::Content => warn!("{}", e),
                ErrorKind::LocalIo => error!("Sync cycle failed: {}", e),
                ErrorKind::FatalApply => error!("FAILED TO APPLY UPDATE: {}", e),
            },
        }
        None
    }

    /// One gather and one flush
    pub async fn run_once(&mut self) -> AgentExit {
        self.gather();
        match self.flush().await {
            Some(reason) => AgentExit::Restart(reason),
            None => AgentExit::Shutdown,
        }
    }

    /// Deliver what is still buffered before stopping. The last flush can
    /// still apply an update, in which case the restart wins.
    pub async fn shutdown(&mut self) -> AgentExit {
        if self.buffer.is_empty() {
            return AgentExit::Shutdown;
        }
        match self.flush().await {
            Some(reason) => AgentExit::Restart(reason),
            None => AgentExit::Shutdown,
        }
    }

    /// Run the main event loop until Ctrl-C or a restart
    #[instrument(skip(self))]
    pub async fn run_event_loop(&mut self) -> Result<AgentExit> {
        info!("Starting agent event loop");
        debug!(
            "Gather interval: {:?}, flush interval: {:?}",
            self.gather_interval, self.flush_interval
        );

        let mut gather_interval = interval(self.gather_interval);
        let mut flush_interval = interval(self.flush_interval);
        gather_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = gather_interval.tick() => self.gather(),

                _ = flush_interval.tick() => {
                    if let Some(reason) = self.flush().await {
                        info!("Stopping event loop: {}", reason);
                        return Ok(AgentExit::Restart(reason));
                    }
                }

                // Handle shutdown signal (Ctrl+C)
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    return Ok(self.shutdown().await);
                }
            }
        }
    }
}
