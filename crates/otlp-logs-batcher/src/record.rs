// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data carried through the engine: log records, resource attributes and batches.
//!
//! The engine treats a [`LogRecord`] as opaque. It is counted as one unit of batch
//! size and handed unchanged to the wire codec.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of a log record, lowest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    #[default]
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Verbose => "Verbose",
            Severity::Debug => "Debug",
            Severity::Information => "Information",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "verbose" | "trace" => Ok(Severity::Verbose),
            "debug" => Ok(Severity::Debug),
            "information" | "info" => Ok(Severity::Information),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "fatal" | "critical" => Ok(Severity::Fatal),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A primitive attribute value. These are the only kinds the exporter ever sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
}

impl AttributeValue {
    /// Converts a JSON value into a primitive attribute, or `None` for
    /// nulls, arrays and objects.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(AttributeValue::Bool(b)),
            Value::String(s) => Some(AttributeValue::String(s)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(AttributeValue::Int(i)),
                None => n.as_f64().map(AttributeValue::Double),
            },
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Parses a raw string the way `OTEL_RESOURCE_ATTRIBUTES` values are interpreted:
    /// booleans, then integers, then floats, falling back to a string.
    pub fn parse_lossy(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(b) = raw.parse::<bool>() {
            return AttributeValue::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return AttributeValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return AttributeValue::Double(f);
            }
        }
        AttributeValue::String(raw.to_string())
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Immutable resource attributes attached to every batch of one engine instance.
///
/// Construction silently drops any value that is not one of the four primitive kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceAttributes {
    attributes: BTreeMap<String, AttributeValue>,
}

impl ResourceAttributes {
    pub fn new<I, K>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let attributes = attributes
            .into_iter()
            .filter_map(|(k, v)| AttributeValue::from_json(v).map(|v| (k.into(), v)))
            .collect();
        Self { attributes }
    }

    /// Parses a `key=value,key2=value2` string. Entries without `=` or with an empty
    /// key are ignored.
    pub fn from_env_string(env_attributes: &str) -> Self {
        let attributes = env_attributes
            .split(',')
            .filter_map(|kv| {
                let (k, v) = kv.split_once('=')?;
                let k = k.trim();
                if k.is_empty() {
                    return None;
                }
                Some((k.to_string(), AttributeValue::parse_lossy(v)))
            })
            .collect();
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, AttributeValue)> for ResourceAttributes {
    fn from_iter<T: IntoIterator<Item = (K, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// One structured application log entry. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub severity: Severity,
    pub message_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_message: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl LogRecord {
    /// Creates a record stamped with the current wall-clock time.
    pub fn new(severity: Severity, message_template: impl Into<String>) -> Self {
        let time_unix_nano = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            time_unix_nano,
            severity,
            message_template: message_template.into(),
            rendered_message: None,
            properties: Map::new(),
            exception: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, time_unix_nano: u64) -> Self {
        self.time_unix_nano = time_unix_nano;
        self
    }
}

/// An ordered group of records cut by the accumulator and consumed once by the exporter.
#[derive(Debug, Clone)]
pub struct Batch {
    sequence: u64,
    records: Vec<LogRecord>,
    resource: Arc<ResourceAttributes>,
}

impl Batch {
    pub(crate) fn new(
        sequence: u64,
        records: Vec<LogRecord>,
        resource: Arc<ResourceAttributes>,
    ) -> Self {
        Self {
            sequence,
            records,
            resource,
        }
    }

    /// Position of this batch in cut order, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn resource(&self) -> &ResourceAttributes {
        &self.resource
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_attributes_drop_non_primitive_values() {
        let attributes = ResourceAttributes::new(vec![
            ("service.name", json!("checkout")),
            ("service.instance", json!(3)),
            ("sample.ratio", json!(0.25)),
            ("debug", json!(true)),
            ("nested", json!({"region": "us-east-1"})),
            ("list", json!([1, 2, 3])),
            ("missing", Value::Null),
        ]);

        assert_eq!(attributes.len(), 4);
        assert_eq!(
            attributes.get("service.name"),
            Some(&AttributeValue::String("checkout".to_string()))
        );
        assert_eq!(attributes.get("service.instance"), Some(&AttributeValue::Int(3)));
        assert_eq!(attributes.get("sample.ratio"), Some(&AttributeValue::Double(0.25)));
        assert_eq!(attributes.get("debug"), Some(&AttributeValue::Bool(true)));
        assert!(attributes.get("nested").is_none());
        assert!(attributes.get("list").is_none());
        assert!(attributes.get("missing").is_none());
    }

    #[test]
    fn test_resource_attributes_from_env_string() {
        let attributes = ResourceAttributes::from_env_string(
            "service.name=api, deployment.replicas=4,ratio=1.5,canary=false,=orphan,noequals",
        );
        assert_eq!(attributes.len(), 4);
        assert_eq!(
            attributes.get("service.name"),
            Some(&AttributeValue::String("api".to_string()))
        );
        assert_eq!(
            attributes.get("deployment.replicas"),
            Some(&AttributeValue::Int(4))
        );
        assert_eq!(attributes.get("ratio"), Some(&AttributeValue::Double(1.5)));
        assert_eq!(attributes.get("canary"), Some(&AttributeValue::Bool(false)));
    }

    #[test]
    fn test_large_unsigned_number_becomes_double() {
        let value = AttributeValue::from_json(json!(u64::MAX));
        assert!(matches!(value, Some(AttributeValue::Double(_))));
    }

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!("info".parse::<Severity>(), Ok(Severity::Information));
        assert_eq!("WARN".parse::<Severity>(), Ok(Severity::Warning));
        assert_eq!(" fatal ".parse::<Severity>(), Ok(Severity::Fatal));
        assert!("loud".parse::<Severity>().is_err());
        assert!(Severity::Verbose < Severity::Debug);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!(Severity::default(), Severity::Verbose);
    }

    #[test]
    fn test_record_serializes_without_empty_fields() {
        let record = LogRecord::new(Severity::Warning, "Disk {Path} is full")
            .with_timestamp(42)
            .with_property("Path", "/var");
        let value = serde_json::to_value(&record).expect("serialize record");
        assert_eq!(
            value,
            json!({
                "time_unix_nano": 42,
                "severity": "Warning",
                "message_template": "Disk {Path} is full",
                "properties": {"Path": "/var"},
            })
        );
    }
}
