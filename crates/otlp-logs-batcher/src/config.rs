// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::EngineError;
use crate::exporter::RetryStrategy;
use crate::queue::OverflowPolicy;
use crate::record::{ResourceAttributes, Severity};
use std::env;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:4317/v1/logs";
pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 100;
pub const DEFAULT_BATCH_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_BATCH_QUEUE_LIMIT: usize = 10_000;
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for one batch engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Destination URL of the remote collector
    pub endpoint: String,
    /// Primitive-valued attributes attached to every batch
    pub resource_attributes: ResourceAttributes,
    /// Locale handed to the message renderer
    pub format_provider: Option<String>,
    /// Records below this severity never reach the engine
    pub restricted_to_minimum_level: Severity,
    /// Size-trigger threshold
    pub batch_size_limit: usize,
    /// Time-trigger interval
    pub batch_period: Duration,
    /// Record queue capacity
    pub batch_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
    /// Flush the very first record immediately instead of waiting for a tick
    pub eager_first_flush: bool,
    pub retry_strategy: RetryStrategy,
    /// Upper bound for a single export attempt
    pub export_timeout: Duration,
    /// zstd level; `None` sends uncompressed payloads
    pub compression_level: Option<i32>,
    pub https_proxy: Option<String>,
    /// Extra headers sent with every export request
    pub headers: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            resource_attributes: ResourceAttributes::default(),
            format_provider: None,
            restricted_to_minimum_level: Severity::Verbose,
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            batch_period: DEFAULT_BATCH_PERIOD,
            batch_queue_limit: DEFAULT_BATCH_QUEUE_LIMIT,
            overflow_policy: OverflowPolicy::default(),
            eager_first_flush: false,
            retry_strategy: RetryStrategy::default(),
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            compression_level: None,
            https_proxy: None,
            headers: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// Unparseable values fall back to their defaults; the result is then validated.
    pub fn from_env() -> Result<Self, EngineError> {
        let defaults = Self::default();

        let endpoint = env::var("OTLP_LOGS_ENDPOINT").unwrap_or(defaults.endpoint);
        let resource_attributes = env::var("OTEL_RESOURCE_ATTRIBUTES")
            .map(|val| ResourceAttributes::from_env_string(&val))
            .unwrap_or_default();
        let format_provider = env::var("OTLP_LOGS_FORMAT_PROVIDER").ok();
        let restricted_to_minimum_level = env_parse::<Severity>("OTLP_LOGS_MINIMUM_LEVEL")
            .unwrap_or(defaults.restricted_to_minimum_level);
        let batch_size_limit =
            env_parse("OTLP_LOGS_BATCH_SIZE_LIMIT").unwrap_or(defaults.batch_size_limit);
        let batch_period = env_parse::<u64>("OTLP_LOGS_BATCH_PERIOD_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.batch_period);
        let batch_queue_limit =
            env_parse("OTLP_LOGS_BATCH_QUEUE_LIMIT").unwrap_or(defaults.batch_queue_limit);
        let overflow_policy =
            env_parse("OTLP_LOGS_OVERFLOW_POLICY").unwrap_or(defaults.overflow_policy);
        let eager_first_flush = env::var("OTLP_LOGS_EAGER_FIRST_FLUSH")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(defaults.eager_first_flush);

        let retry_strategy = match defaults.retry_strategy {
            RetryStrategy::Exponential {
                max_attempts,
                base_delay,
                max_delay,
            } => RetryStrategy::Exponential {
                max_attempts: env_parse("OTLP_LOGS_MAX_RETRIES").unwrap_or(max_attempts),
                base_delay: env_parse::<u64>("OTLP_LOGS_RETRY_BACKOFF_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(base_delay),
                max_delay: env_parse::<u64>("OTLP_LOGS_RETRY_BACKOFF_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(max_delay),
            },
            other => other,
        };

        let export_timeout = env_parse::<u64>("OTLP_LOGS_EXPORT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.export_timeout);
        let compression_level = env_parse::<i32>("OTLP_LOGS_COMPRESSION_LEVEL");
        let https_proxy = env::var("OTLP_LOGS_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let headers = env::var("OTLP_LOGS_HEADERS")
            .map(|val| parse_headers(&val))
            .unwrap_or_default();

        let config = Self {
            endpoint,
            resource_attributes,
            format_provider,
            restricted_to_minimum_level,
            batch_size_limit,
            batch_period,
            batch_queue_limit,
            overflow_policy,
            eager_first_flush,
            retry_strategy,
            export_timeout,
            compression_level,
            https_proxy,
            headers,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.endpoint.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "endpoint cannot be empty".to_string(),
            ));
        }
        if self.batch_size_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "batch_size_limit must be greater than 0".to_string(),
            ));
        }
        if self.batch_queue_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "batch_queue_limit must be greater than 0".to_string(),
            ));
        }
        if self.batch_size_limit > self.batch_queue_limit {
            return Err(EngineError::InvalidConfig(format!(
                "batch_size_limit ({}) cannot exceed batch_queue_limit ({})",
                self.batch_size_limit, self.batch_queue_limit
            )));
        }
        if self.batch_period.is_zero() {
            return Err(EngineError::InvalidConfig(
                "batch_period must be greater than 0".to_string(),
            ));
        }
        if self.retry_strategy.max_attempts() == 0 {
            return Err(EngineError::InvalidConfig(
                "retry strategy must allow at least one attempt".to_string(),
            ));
        }
        if let Some(level) = self.compression_level {
            if !zstd::compression_level_range().contains(&level) {
                return Err(EngineError::InvalidConfig(format!(
                    "Invalid zstd compression level {level}"
                )));
            }
        }
        Ok(())
    }
}
