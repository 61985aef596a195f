//! Memory input

use super::{parse_options, Input};
use crate::metrics::Metric;
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MemOptions {
    /// Also report swap usage
    swap: bool,
}

pub(super) struct MemInput {
    options: MemOptions,
    system: System,
}

pub(super) fn create(options: &toml::Value) -> Result<Box<dyn Input>> {
    let options: MemOptions = parse_options(options)?;
    Ok(Box::new(MemInput {
        options,
        system: System::new(),
    }))
}

fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

impl Input for MemInput {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn gather(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let available = self.system.available_memory();

        let mut metrics = vec![Metric::new("mem")
            .with_field("total", total)
            .with_field("used", used)
            .with_field("available", available)
            .with_field("free", self.system.free_memory())
            .with_field("used_percent", percent(used, total))
            .with_field("available_percent", percent(available, total))];

        if self.options.swap {
            let swap_total = self.system.total_swap();
            let swap_used = self.system.used_swap();
            metrics.push(
                Metric::new("swap")
                    .with_field("total", swap_total)
                    .with_field("used", swap_used)
                    .with_field("free", self.system.free_swap())
                    .with_field("used_percent", percent(swap_used, swap_total)),
            );
        }

        Ok(metrics)
    }
}
