// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Front-end adapter between a logging pipeline and the [`BatchEngine`].
//!
//! Records below the configured minimum severity never reach the engine. Records that
//! pass get their final message text rendered once, here, so the wire codec does not
//! have to know about message templates.

use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::EngineConfig;
use crate::engine::{BatchEngine, BatchEngineBuilder};
use crate::error::EngineError;
use crate::record::{LogRecord, Severity};

/// Renders the final text of a record.
pub trait MessageRenderer: Send + Sync {
    /// `format_provider` is the configured locale/format name, if any.
    fn render(&self, record: &LogRecord, format_provider: Option<&str>) -> String;
}

/// Substitutes `{Name}` placeholders in the message template with record properties.
///
/// - `{Name}` renders strings quoted and everything else as JSON.
/// - `{Name:l}` renders strings without quotes.
/// - `{Name:0.00}`, `{Name:F2}` and `{Name:N2}` render numbers with fixed decimals.
/// - `{@Name}` renders the value as JSON, `{$Name}` as plain text.
/// - `{{` and `}}` are literal braces.
///
/// Placeholders without a matching property are kept verbatim. Formatting is
/// culture-invariant; the format provider is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateRenderer;

impl MessageRenderer for TemplateRenderer {
    fn render(&self, record: &LogRecord, _format_provider: Option<&str>) -> String {
        render_template(&record.message_template, &record.properties)
    }
}

fn render_template(template: &str, properties: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        let Some(end) = tail.find('}') else {
            // Unterminated placeholder
            out.push_str(tail);
            return out;
        };
        let token = &tail[1..end];
        match render_token(token, properties) {
            Some(rendered) => out.push_str(&rendered),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    out
}

fn render_token(token: &str, properties: &Map<String, Value>) -> Option<String> {
    let (hint, token) = match token.as_bytes().first() {
        Some(b'@') => (Some('@'), &token[1..]),
        Some(b'$') => (Some('$'), &token[1..]),
        _ => (None, token),
    };
    let (name, format) = match token.split_once(':') {
        Some((name, format)) => (name, Some(format)),
        None => (token, None),
    };
    // Alignment (`{Name,10}`) is accepted and ignored
    let name = name.split(',').next().unwrap_or(name).trim();
    if name.is_empty() {
        return None;
    }
    let value = properties.get(name)?;

    let rendered = match (hint, value) {
        (Some('@'), value) => value.to_string(),
        (Some('$'), Value::String(s)) => s.clone(),
        (_, Value::String(s)) if format == Some("l") => s.clone(),
        (_, Value::Number(n)) => match format.and_then(decimal_places) {
            Some(places) => n
                .as_f64()
                .map_or_else(|| n.to_string(), |f| format!("{f:.places$}")),
            None => n.to_string(),
        },
        (_, value) => value.to_string(),
    };
    Some(rendered)
}

/// Number of decimals requested by `0.00`, `F2` or `N2` style formats.
fn decimal_places(format: &str) -> Option<usize> {
    if let Some(digits) = format
        .strip_prefix(['F', 'f', 'N', 'n'])
        .filter(|d| !d.is_empty())
    {
        return digits.parse().ok();
    }
    let (int, frac) = format.split_once('.')?;
    if !int.is_empty()
        && int.chars().all(|c| c == '0' || c == '#')
        && frac.chars().all(|c| c == '0' || c == '#')
    {
        return Some(frac.len());
    }
    None
}

/// A level-filtering, rendering front-end owning a [`BatchEngine`].
pub struct LogSink {
    engine: BatchEngine,
    minimum_level: Severity,
    format_provider: Option<String>,
    renderer: Box<dyn MessageRenderer>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("engine", &self.engine)
            .field("minimum_level", &self.minimum_level)
            .field("format_provider", &self.format_provider)
            .finish_non_exhaustive()
    }
}

impl LogSink {
    /// Starts an engine from `config` with the default collaborators.
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::from_builder(BatchEngine::builder(config.clone()), &config)
    }

    /// Starts the engine from a customised builder; `config` supplies the level and
    /// format provider.
    pub fn from_builder(
        builder: BatchEngineBuilder,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            engine: builder.start()?,
            minimum_level: config.restricted_to_minimum_level,
            format_provider: config.format_provider.clone(),
            renderer: Box::new(TemplateRenderer),
        })
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Box<dyn MessageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Returns `true` if the record was handed to the engine and accepted.
    pub fn emit(&self, mut record: LogRecord) -> bool {
        if record.severity < self.minimum_level {
            return false;
        }
        if record.rendered_message.is_none() {
            record.rendered_message = Some(
                self.renderer
                    .render(&record, self.format_provider.as_deref()),
            );
        }
        let accepted = self.engine.enqueue(record);
        if !accepted {
            debug!("LOGS | Record not accepted by the batch engine");
        }
        accepted
    }

    pub fn engine(&self) -> &BatchEngine {
        &self.engine
    }

    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.engine.shutdown(timeout).await
    }
}
