//! Metric records and batch serializers
//!
//! Inputs produce [`Metric`]s; the agent buffers them and, on every flush,
//! serializes the batch into the body of the poll request.

mod influx;
mod json;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Unsigned(u64),
    Bool(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(f64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Unsigned(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// A measurement with tags, fields and a timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add `key=value` unless the metric already carries that tag
    pub fn add_default_tag(&mut self, key: &str, value: &str) {
        self.tags
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
}

/// Wire format of a metric batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// InfluxDB line protocol
    #[default]
    Influx,
    Json,
}

impl DataFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            DataFormat::Influx => "text/plain; charset=utf-8",
            DataFormat::Json => "application/json",
        }
    }

    /// Serialize a batch. An empty batch serializes to an empty body for the
    /// line protocol and to an empty `metrics` array for JSON.
    pub fn serialize(&self, metrics: &[Metric]) -> Result<Vec<u8>> {
        match self {
            DataFormat::Influx => Ok(influx::serialize_batch(metrics).into_bytes()),
            DataFormat::Json => json::serialize_batch(metrics),
        }
    }
}
