//! Health, status and Prometheus endpoints
//!
//! - `GET /health`  liveness probe
//! - `GET /status`  JSON snapshot of the sync state
//! - `GET /metrics` Prometheus text exposition

use crate::sync::error::ErrorKind;
use crate::sync::{CycleReport, SyncOutcome};
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

/// Point-in-time view of the sync state served on `/status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub revision: Option<String>,
    pub fingerprint: Option<String>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub last_cycle: Option<DateTime<Utc>>,
    pub buffered_metrics: usize,
    pub restarting: bool,
}

/// Counters and state shared between the agent loop and the HTTP server
pub struct SyncStatus {
    registry: Registry,
    cycles: IntCounterVec,
    delivered: IntCounter,
    buffered: IntGauge,
    snapshot: RwLock<StatusSnapshot>,
}

/// Label value for the `outcome` of a cycle
pub fn outcome_label(outcome: &Result<SyncOutcome, crate::sync::error::SyncError>) -> &'static str {
    match outcome {
        Ok(SyncOutcome::NoChange) => "no_change",
        Ok(SyncOutcome::Skipped) => "skipped",
        Ok(SyncOutcome::NoRealUpdate) => "no_real_update",
        Ok(SyncOutcome::Restarting(_)) => "restarting",
        Err(e) => match e.kind() {
            ErrorKind::Transport => "transport_error",
            ErrorKind::Content => "rejected",
            ErrorKind::LocalIo => "local_io_error",
            ErrorKind::FatalApply => "fatal_apply_error",
        },
    }
}

impl SyncStatus {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles = IntCounterVec::new(
            Opts::new("syncagent_sync_cycles_total", "Sync cycles by outcome"),
            &["outcome"],
        )?;
        let delivered = IntCounter::new(
            "syncagent_batches_delivered_total",
            "Metric batches accepted by the control endpoint",
        )?;
        let buffered = IntGauge::new(
            "syncagent_buffered_metrics",
            "Metrics waiting for delivery",
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(buffered.clone()))?;

        Ok(Self {
            registry,
            cycles,
            delivered,
            buffered,
            snapshot: RwLock::new(StatusSnapshot::default()),
        })
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }

    /// Record the result of one cycle
    pub fn record_cycle(
        &self,
        report: &CycleReport,
        revision: Option<String>,
        fingerprint: Option<String>,
    ) {
        let label = outcome_label(&report.outcome);
        self.cycles.with_label_values(&[label]).inc();
        if report.delivered {
            self.delivered.inc();
        }

        self.update(|s| {
            s.revision = revision;
            s.fingerprint = fingerprint;
            s.last_outcome = Some(label.to_string());
            s.last_error = report.outcome.as_ref().err().map(|e| e.to_string());
            s.last_cycle = Some(Utc::now());
            s.restarting |= report.is_restarting();
        });
    }

    pub fn set_buffered(&self, count: usize) {
        self.buffered.set(count as i64);
        self.update(|s| s.buffered_metrics = count);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Prometheus text exposition of all counters
    pub fn render_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/status", get(status_endpoint))
            .route("/metrics", get(metrics_endpoint))
            .with_state(self)
    }

    /// Serve the endpoints on `0.0.0.0:<port>` in the background
    pub async fn serve(self: Arc<Self>, port: u16) -> Result<tokio::task::JoinHandle<()>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status endpoint on {}", addr))?;
        info!("Status endpoint listening on http://{}", addr);

        let app = self.router();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Status endpoint stopped: {}", e);
            }
        }))
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status_endpoint(State(status): State<Arc<SyncStatus>>) -> Json<StatusSnapshot> {
    Json(status.snapshot())
}

async fn metrics_endpoint(State(status): State<Arc<SyncStatus>>) -> (StatusCode, String) {
    match status.render_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}
