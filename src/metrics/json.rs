//! JSON batch format
//!
//! `{"metrics":[{"name":..,"tags":{..},"fields":{..},"timestamp":<unix seconds>}]}`

use super::{FieldValue, Metric};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct Batch<'a> {
    metrics: Vec<JsonMetric<'a>>,
}

#[derive(Serialize)]
struct JsonMetric<'a> {
    name: &'a str,
    tags: &'a BTreeMap<String, String>,
    fields: BTreeMap<&'a str, &'a FieldValue>,
    timestamp: i64,
}

pub(super) fn serialize_batch(metrics: &[Metric]) -> Result<Vec<u8>> {
    let batch = Batch {
        metrics: metrics
            .iter()
            .map(|m| JsonMetric {
                name: &m.name,
                tags: &m.tags,
                // serde_json cannot represent NaN or infinity
                fields: m
                    .fields
                    .iter()
                    .filter(|(_, v)| !matches!(v, FieldValue::Float(f) if !f.is_finite()))
                    .map(|(k, v)| (k.as_str(), v))
                    .collect(),
                timestamp: m.timestamp.timestamp(),
            })
            .collect(),
    };
    serde_json::to_vec(&batch).context("Failed to serialize metrics as JSON")
}
