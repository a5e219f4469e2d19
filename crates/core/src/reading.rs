use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped observation from an asset: an ordered set of named
/// data-points plus the time the value was observed (`user_ts`) and the
/// time it entered the pipeline (`ingest_ts`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub asset: String,
    pub datapoints: Vec<Datapoint>,
    pub user_ts: DateTime<Utc>,
    /// Defaults to arrival time when absent from serialized input.
    #[serde(default = "Utc::now")]
    pub ingest_ts: DateTime<Utc>,
}

/// A single named value within a reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Datapoint {
    pub name: String,
    pub value: DatapointValue,
}

/// Typed data-point values. Source data arrives in many shapes but the
/// filter only interprets the numeric variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DatapointValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Null,
}

impl DatapointValue {
    /// Numeric view of the value, or None for non-numeric variants.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DatapointValue::Integer(i) => Some(*i as f64),
            DatapointValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl Reading {
    /// Create an empty reading with both timestamps set to `user_ts`.
    pub fn new(asset: impl Into<String>, user_ts: DateTime<Utc>) -> Self {
        Self {
            asset: asset.into(),
            datapoints: Vec::new(),
            user_ts,
            ingest_ts: user_ts,
        }
    }

    /// Append a data-point, returning self for chained construction.
    pub fn with_datapoint(mut self, name: impl Into<String>, value: DatapointValue) -> Self {
        self.datapoints.push(Datapoint {
            name: name.into(),
            value,
        });
        self
    }

    /// Value of the last data-point carrying `name`, if any.
    ///
    /// Duplicate names are legal in a reading; the last occurrence wins,
    /// matching how the filter resolves its pre-trigger match value.
    pub fn datapoint(&self, name: &str) -> Option<&DatapointValue> {
        self.datapoints
            .iter()
            .rev()
            .find(|dp| dp.name == name)
            .map(|dp| &dp.value)
    }

    /// Iterate the numeric data-points as (name, value) pairs, skipping
    /// non-numeric variants.
    pub fn numeric_datapoints(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.datapoints
            .iter()
            .filter_map(|dp| dp.value.as_number().map(|v| (dp.name.as_str(), v)))
    }
}
