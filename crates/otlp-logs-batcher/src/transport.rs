// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default wire codec and HTTP transport.
//!
//! Both are collaborators of the engine and can be replaced through
//! [`crate::engine::BatchEngineBuilder`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, error};
use zstd::stream::write::Encoder;

use crate::config::EngineConfig;
use crate::error::{EncodeError, EngineError, TransportError};
use crate::exporter::{LogsEncoder, LogsTransport};
use crate::record::{Batch, LogRecord, ResourceAttributes};

#[derive(Serialize)]
struct JsonPayload<'a> {
    resource: &'a ResourceAttributes,
    records: &'a [LogRecord],
}

/// Serializes a batch as `{"resource": {...}, "records": [...]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl LogsEncoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(&JsonPayload {
            resource: batch.resource(),
            records: batch.records(),
        })
        .map_err(|e| EncodeError(e.to_string()))
    }
}

pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

/// Posts each payload to the collector endpoint, optionally zstd-compressed.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = match build_client(config.https_proxy.as_deref(), config.export_timeout) {
            Ok(client) => client,
            Err(e) => {
                error!("LOGS | Unable to parse proxy configuration: {e}, no proxy will be used");
                build_client(None, config.export_timeout)
                    .map_err(|e| EngineError::Transport(e.to_string()))?
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| EngineError::InvalidConfig(format!("header '{name}': {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| EngineError::InvalidConfig(format!("header '{name}': {e}")))?;
            headers.insert(name, value);
        }
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            headers,
            compression_level: config.compression_level,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn compress(&self, payload: Bytes) -> Result<Bytes, TransportError> {
        let Some(level) = self.compression_level else {
            return Ok(payload);
        };
        let encode = || -> std::io::Result<Vec<u8>> {
            let mut encoder = Encoder::new(Vec::new(), level)?;
            encoder.write_all(&payload)?;
            encoder.finish()
        };
        encode()
            .map(Bytes::from)
            .map_err(|e| TransportError::Permanent(format!("failed to compress payload: {e}")))
    }
}

/// Maps a collector response status onto the retry taxonomy.
pub fn classify_status(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    let retriable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retriable {
        Err(TransportError::Transient(status.to_string()))
    } else {
        Err(TransportError::Permanent(status.to_string()))
    }
}

#[async_trait]
impl LogsTransport for HttpTransport {
    async fn send(
        &self,
        payload: Bytes,
        content_type: &'static str,
    ) -> Result<(), TransportError> {
        let body = self.compress(payload)?;
        let time = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await;
        let elapsed = time.elapsed();

        match resp {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
                    error!("LOGS | Request was denied by the collector ({status}). Please verify the configured credentials.");
                }
                debug!(
                    "LOGS | Collector answered {status} in {} ms",
                    elapsed.as_millis()
                );
                classify_status(status)
            }
            Err(e) => Err(TransportError::Transient(format!(
                "request failed after {} ms: {e}",
                elapsed.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttributeValue, Severity};
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::ACCEPTED).is_ok());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE)
            .unwrap_err()
            .is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS)
            .unwrap_err()
            .is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT)
            .unwrap_err()
            .is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST)
            .unwrap_err()
            .is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED)
            .unwrap_err()
            .is_transient());
    }

    #[test]
    fn test_json_encoder_payload_shape() {
        let resource: ResourceAttributes = [
            ("service.name", AttributeValue::from("api")),
            ("replicas", AttributeValue::from(2i64)),
        ]
        .into_iter()
        .collect();
        let records = vec![
            LogRecord::new(Severity::Error, "boom").with_timestamp(1),
            LogRecord::new(Severity::Debug, "ok").with_timestamp(2),
        ];
        let batch = Batch::new(0, records, Arc::new(resource));

        let bytes = JsonEncoder.encode(&batch).expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(value["resource"], json!({"replicas": 2, "service.name": "api"}));
        assert_eq!(value["records"][0]["message_template"], "boom");
        assert_eq!(value["records"][1]["severity"], "Debug");
        assert_eq!(JsonEncoder.content_type(), "application/json");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let config = EngineConfig {
            headers: vec![("bad header".to_string(), "x".to_string())],
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_compression_roundtrip() {
        let config = EngineConfig {
            compression_level: Some(3),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).expect("transport");
        let payload = Bytes::from_static(b"{\"records\":[]}");
        let compressed = transport.compress(payload.clone()).expect("compress");
        assert_ne!(compressed, payload);
        let decoded = zstd::decode_all(compressed.as_ref()).expect("decode");
        assert_eq!(decoded, payload.as_ref());
    }
}
