//! Disk usage input
//!
//! ```toml
//! [[inputs.disk]]
//!   mount_points = ["/", "/var"]
//!   ignore_fs = ["tmpfs", "devtmpfs", "overlay"]
//! ```

use super::{parse_options, Input};
use crate::metrics::Metric;
use anyhow::Result;
use serde::Deserialize;
use sysinfo::Disks;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DiskOptions {
    /// Only report these mount points (empty: all)
    mount_points: Vec<String>,
    /// Skip file systems of these types
    ignore_fs: Vec<String>,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            mount_points: Vec::new(),
            ignore_fs: ["tmpfs", "devtmpfs", "devfs", "overlay", "squashfs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

pub(super) struct DiskInput {
    options: DiskOptions,
    disks: Disks,
}

pub(super) fn create(options: &toml::Value) -> Result<Box<dyn Input>> {
    let options: DiskOptions = parse_options(options)?;
    Ok(Box::new(DiskInput {
        options,
        disks: Disks::new(),
    }))
}

impl DiskOptions {
    fn wants(&self, mount_point: &str, fstype: &str) -> bool {
        if self.ignore_fs.iter().any(|fs| fs == fstype) {
            return false;
        }
        self.mount_points.is_empty() || self.mount_points.iter().any(|m| m == mount_point)
    }
}

impl Input for DiskInput {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn gather(&mut self) -> Result<Vec<Metric>> {
        self.disks.refresh_list();

        let mut metrics = Vec::new();
        for disk in self.disks.list() {
            let mount_point = disk.mount_point().to_string_lossy().to_string();
            let fstype = disk.file_system().to_string_lossy().to_string();
            if !self.options.wants(&mount_point, &fstype) {
                continue;
            }

            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            let used_percent = if total > 0 {
                (used as f64 / total as f64) * 100.0
            } else {
                0.0
            };

            metrics.push(
                Metric::new("disk")
                    .with_tag("path", mount_point)
                    .with_tag("device", disk.name().to_string_lossy().to_string())
                    .with_tag("fstype", fstype)
                    .with_field("total", total)
                    .with_field("free", free)
                    .with_field("used", used)
                    .with_field("used_percent", used_percent),
            );
        }
        Ok(metrics)
    }
}
