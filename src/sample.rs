//! Counter samples delivered by the monitoring server

use serde::Deserialize;
use std::collections::BTreeMap;

/// Aggregation level of a counter sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeType {
    /// Current value, as collected
    Realtime,
    OneMin,
    FiveMin,
    TenMin,
    Hour,
    Day,
}

impl TimeType {
    pub fn is_realtime(&self) -> bool {
        matches!(self, TimeType::Realtime)
    }
}

/// Value carried by a single counter field
///
/// Only `Integer`, `Unsigned` and `Float` are numeric; everything else is
/// skipped when a sample is encoded. `Unsigned` holds whole numbers above
/// `i64::MAX`, and `Other` holds arrays and objects so that one odd counter
/// does not reject the whole sample.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Null,
    Other(serde_json::Value),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => FieldValue::Integer(v),
            Err(_) => FieldValue::Unsigned(value),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// One periodic performance-counter sample for a monitored object
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSample {
    /// Name of the monitored object (agent)
    pub object_name: String,
    pub time_type: TimeType,
    /// Collection time in milliseconds since the epoch
    pub timestamp_millis: i64,
    /// Counter values keyed by counter name
    #[serde(default)]
    pub data_fields: BTreeMap<String, FieldValue>,
}

impl CounterSample {
    /// Create a sample with no fields
    pub fn new(object_name: impl Into<String>, time_type: TimeType, timestamp_millis: i64) -> Self {
        Self {
            object_name: object_name.into(),
            time_type,
            timestamp_millis,
            data_fields: BTreeMap::new(),
        }
    }

    /// Add a field, replacing any previous value under the same name
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.data_fields.insert(name.into(), value.into());
        self
    }
}
