//! CPU usage input
//!
//! ```toml
//! [[inputs.cpu]]
//!   percpu = true
//!   totalcpu = true
//! ```
//!
//! Usage is measured between two refreshes, so the first gather after start
//! reports zero.

use super::{parse_options, Input};
use crate::metrics::Metric;
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CpuOptions {
    percpu: bool,
    totalcpu: bool,
}

impl Default for CpuOptions {
    fn default() -> Self {
        Self {
            percpu: true,
            totalcpu: true,
        }
    }
}

pub(super) struct CpuInput {
    options: CpuOptions,
    system: System,
}

pub(super) fn create(options: &toml::Value) -> Result<Box<dyn Input>> {
    let options: CpuOptions = parse_options(options)?;
    let mut system = System::new();
    system.refresh_cpu();
    Ok(Box::new(CpuInput { options, system }))
}

fn usage_metric(cpu: &str, usage: f32) -> Metric {
    let usage = f64::from(usage).clamp(0.0, 100.0);
    Metric::new("cpu")
        .with_tag("cpu", cpu)
        .with_field("usage_active", usage)
        .with_field("usage_idle", 100.0 - usage)
}

impl Input for CpuInput {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn gather(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_cpu();

        let mut metrics = Vec::new();
        if self.options.percpu {
            for (i, cpu) in self.system.cpus().iter().enumerate() {
                metrics.push(usage_metric(&format!("cpu{}", i), cpu.cpu_usage()));
            }
        }
        if self.options.totalcpu {
            metrics.push(usage_metric(
                "cpu-total",
                self.system.global_cpu_info().cpu_usage(),
            ));
        }
        Ok(metrics)
    }
}
