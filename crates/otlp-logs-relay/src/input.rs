// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns stdin lines into log records.
//!
//! A line holding a JSON object is read as a structured event: `@t`/`timestamp` is
//! ignored in favour of the arrival time, `@l`/`level` is the severity,
//! `@mt`/`message`/`msg` the template, `@x`/`exception` the exception and every other
//! field becomes a property. Anything else is a plain-text record at the default level.

use otlp_logs_batcher::{LogRecord, Severity};
use serde_json::{Map, Value};

const LEVEL_KEYS: [&str; 2] = ["@l", "level"];
const TEMPLATE_KEYS: [&str; 3] = ["@mt", "message", "msg"];
const EXCEPTION_KEYS: [&str; 2] = ["@x", "exception"];
const IGNORED_KEYS: [&str; 2] = ["@t", "timestamp"];

pub fn parse_line(line: &str, default_level: Severity) -> Option<LogRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    if line.trim_start().starts_with('{') {
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(line) {
            return Some(from_fields(fields, default_level));
        }
    }
    Some(LogRecord::new(default_level, line))
}

fn from_fields(mut fields: Map<String, Value>, default_level: Severity) -> LogRecord {
    let severity = take_first(&mut fields, &LEVEL_KEYS)
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(default_level);
    let template = match take_first(&mut fields, &TEMPLATE_KEYS) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let exception = take_first(&mut fields, &EXCEPTION_KEYS).map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });
    for key in IGNORED_KEYS {
        fields.remove(key);
    }

    let mut record = LogRecord::new(severity, template);
    record.properties = fields;
    record.exception = exception;
    record
}

/// Removes every alias and returns the value of the first one present.
fn take_first(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(value) = fields.remove(*key) {
            found.get_or_insert(value);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_line() {
        let record = parse_line("service started\n", Severity::Information).unwrap();
        assert_eq!(record.severity, Severity::Information);
        assert_eq!(record.message_template, "service started");
        assert!(record.properties.is_empty());
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert!(parse_line("", Severity::Information).is_none());
        assert!(parse_line("   \r\n", Severity::Information).is_none());
    }

    #[test]
    fn test_structured_line() {
        let line = r#"{"@t":"2024-01-01T00:00:00Z","@l":"Warning","@mt":"Disk {Disk} at {Pct}%","Disk":"sda","Pct":91,"@x":"IOException"}"#;
        let record = parse_line(line, Severity::Information).unwrap();
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.message_template, "Disk {Disk} at {Pct}%");
        assert_eq!(record.exception.as_deref(), Some("IOException"));
        assert_eq!(record.properties.get("Disk"), Some(&json!("sda")));
        assert_eq!(record.properties.get("Pct"), Some(&json!(91)));
        assert!(!record.properties.contains_key("@t"));
    }

    #[test]
    fn test_structured_line_with_aliases_and_unknown_level() {
        let line = r#"{"level":"loud","msg":"fallback","message":"preferred","user":"ana"}"#;
        let record = parse_line(line, Severity::Debug).unwrap();
        assert_eq!(record.severity, Severity::Debug);
        assert_eq!(record.message_template, "preferred");
        assert_eq!(record.properties.len(), 1);
    }

    #[test]
    fn test_invalid_json_is_plain_text() {
        let record = parse_line("{not json", Severity::Error).unwrap();
        assert_eq!(record.message_template, "{not json");
        assert_eq!(record.severity, Severity::Error);
    }
}
