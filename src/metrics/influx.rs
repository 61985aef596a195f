//! InfluxDB line protocol
//!
//! `measurement[,tag=value...] field=value[,field=value...] timestamp_ns`

use super::{FieldValue, Metric};
use std::fmt::Write;

pub(super) fn serialize_batch(metrics: &[Metric]) -> String {
    let mut out = String::new();
    for metric in metrics {
        write_metric(&mut out, metric);
    }
    out
}

fn write_metric(out: &mut String, metric: &Metric) {
    let fields: Vec<String> = metric
        .fields
        .iter()
        .filter_map(|(key, value)| format_field(value).map(|v| format!("{}={}", escape_key(key), v)))
        .collect();

    // A line without fields is invalid
    if fields.is_empty() {
        return;
    }

    out.push_str(&escape_measurement(&metric.name));
    for (key, value) in &metric.tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(out, ",{}={}", escape_key(key), escape_key(value));
    }
    out.push(' ');
    out.push_str(&fields.join(","));
    let _ = writeln!(
        out,
        " {}",
        metric.timestamp.timestamp_nanos_opt().unwrap_or_default()
    );
}

fn format_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) if !v.is_finite() => None,
        FieldValue::Float(v) => Some(format!("{}", v)),
        FieldValue::Integer(v) => Some(format!("{}i", v)),
        FieldValue::Unsigned(v) => Some(format!("{}u", v)),
        FieldValue::Bool(v) => Some(v.to_string()),
        FieldValue::String(v) => Some(format!(
            "\"{}\"",
            v.replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(key: &str) -> String {
    key.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
