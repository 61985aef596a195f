//! Load average, uptime and CPU count

use super::{parse_options, Input};
use crate::metrics::Metric;
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SystemOptions {}

pub(super) struct SystemInput {
    system: System,
}

pub(super) fn create(options: &toml::Value) -> Result<Box<dyn Input>> {
    let _: SystemOptions = parse_options(options)?;
    let mut system = System::new();
    system.refresh_cpu();
    Ok(Box::new(SystemInput { system }))
}

impl Input for SystemInput {
    fn name(&self) -> &'static str {
        "system"
    }

    fn gather(&mut self) -> Result<Vec<Metric>> {
        let load = System::load_average();
        Ok(vec![Metric::new("system")
            .with_field("load1", load.one)
            .with_field("load5", load.five)
            .with_field("load15", load.fifteen)
            .with_field("n_cpus", self.system.cpus().len() as u64)
            .with_field("uptime", System::uptime())])
    }
}
