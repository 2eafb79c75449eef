//! Conversion of counter samples into line-protocol points
//!
//! A point carries three tags (object name, type and family), the sample
//! timestamp in milliseconds and every numeric counter of the sample.

use std::collections::BTreeMap;
use std::fmt::{self, Write};

use crate::error::{ForwarderError, Result};
use crate::sample::{CounterSample, FieldValue};

/// Tag holding the object name
pub const TAG_OBJECT_NAME: &str = "obj";
/// Tag holding the object type
pub const TAG_OBJECT_TYPE: &str = "objType";
/// Tag holding the object family
pub const TAG_OBJECT_FAMILY: &str = "objFamily";

/// Field name reserved for the point timestamp
const RESERVED_TIME_FIELD: &str = "time";

/// Numeric value of a point field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldNumber {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
}

impl FieldNumber {
    /// Numeric value of a field; NaN and infinities have no line-protocol form
    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Integer(v) => Some(FieldNumber::Integer(*v)),
            FieldValue::Unsigned(v) => Some(FieldNumber::Unsigned(*v)),
            FieldValue::Float(v) if v.is_finite() => Some(FieldNumber::Float(*v)),
            FieldValue::Float(_)
            | FieldValue::Boolean(_)
            | FieldValue::Text(_)
            | FieldValue::Null
            | FieldValue::Other(_) => None,
        }
    }
}

impl fmt::Display for FieldNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldNumber::Integer(v) => write!(f, "{}i", v),
            FieldNumber::Unsigned(v) => write!(f, "{}u", v),
            FieldNumber::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A single measurement point ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPoint {
    pub measurement: String,
    /// Tags in write order: object name, type, family
    pub tags: Vec<(String, String)>,
    pub timestamp_millis: i64,
    pub fields: BTreeMap<String, FieldNumber>,
}

impl EncodedPoint {
    /// Look up a tag value by key
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render the point as one line of line protocol (no trailing newline)
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(64 + self.fields.len() * 16);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        let mut separator = ' ';
        for (key, value) in &self.fields {
            line.push(separator);
            separator = ',';
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            // Writing into a String cannot fail
            let _ = write!(line, "{}", value);
        }

        let _ = write!(line, " {}", self.timestamp_millis);
        line
    }
}

impl fmt::Display for EncodedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_protocol())
    }
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Builds points from counter samples
#[derive(Debug, Clone, Copy, Default)]
pub struct PointEncoder;

impl PointEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a sample into a point
    ///
    /// Null, non-numeric, non-finite and `time` fields are skipped. Fails when a tag value
    /// is empty or when no numeric field survives.
    pub fn encode(
        &self,
        sample: &CounterSample,
        object_type: &str,
        object_family: &str,
        measurement: &str,
    ) -> Result<EncodedPoint> {
        if measurement.is_empty() {
            return Err(ForwarderError::Encode("Measurement name is empty".to_string()));
        }
        if sample.object_name.is_empty() {
            return Err(ForwarderError::Encode("Sample has no object name".to_string()));
        }
        if object_type.is_empty() || object_family.is_empty() {
            return Err(ForwarderError::Lookup(format!(
                "Object '{}' has no type or family",
                sample.object_name
            )));
        }

        let fields: BTreeMap<String, FieldNumber> = sample
            .data_fields
            .iter()
            .filter(|(key, _)| key.as_str() != RESERVED_TIME_FIELD)
            .filter_map(|(key, value)| FieldNumber::from_value(value).map(|n| (key.clone(), n)))
            .collect();

        if fields.is_empty() {
            return Err(ForwarderError::Encode(format!(
                "Sample for '{}' has no numeric fields",
                sample.object_name
            )));
        }

        Ok(EncodedPoint {
            measurement: measurement.to_string(),
            tags: vec![
                (TAG_OBJECT_NAME.to_string(), sample.object_name.clone()),
                (TAG_OBJECT_TYPE.to_string(), object_type.to_string()),
                (TAG_OBJECT_FAMILY.to_string(), object_family.to_string()),
            ],
            timestamp_millis: sample.timestamp_millis,
            fields,
        })
    }
}
