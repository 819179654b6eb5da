// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships completed batches to the collector with bounded retries.
//!
//! ```text
//!   Batch ──> LogsEncoder::encode ──> LogsTransport::send ──> Delivered
//!                    │                        │
//!                    │ EncodeError            ├─ Permanent ──> Failed (no retry)
//!                    v                        │
//!                 Failed                      └─ Transient ──> backoff, try again
//!                                                                 │
//!                                                    attempts exhausted ──> Dropped
//! ```
//!
//! Records of a batch that is not delivered are never requeued.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use crate::error::{EncodeError, TransportError};
use crate::record::Batch;

/// Wire codec: serializes a batch and its resource attributes.
pub trait LogsEncoder: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, EncodeError>;
}

/// RPC transport: performs the network call for one serialized payload.
#[async_trait]
pub trait LogsTransport: Send + Sync {
    async fn send(&self, payload: Bytes, content_type: &'static str)
        -> Result<(), TransportError>;
}

/// Terminal outcome of exporting one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportResult {
    Delivered,
    /// Non-retriable failure, batch discarded.
    Failed(String),
    /// Transient failures outlasted the retry budget, batch discarded.
    Dropped(String),
}

impl ExportResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ExportResult::Delivered)
    }
}

/// How a batch is retried after a transient failure. Attempt counts include the
/// first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate(u32),
    /// attempts, delay in milliseconds
    LinearBackoff(u32, u64),
    Exponential {
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryStrategy {
    pub fn max_attempts(&self) -> u32 {
        match *self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                attempts
            }
            RetryStrategy::Exponential { max_attempts, .. } => max_attempts,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(delay_ms),
            RetryStrategy::Exponential {
                base_delay,
                max_delay,
                ..
            } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                base_delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

/// Delivery state of a single batch, dropped once the export terminates.
#[derive(Debug)]
struct ExportAttempt {
    attempt: u32,
    next_delay: Duration,
}

impl ExportAttempt {
    fn new() -> Self {
        Self {
            attempt: 0,
            next_delay: Duration::ZERO,
        }
    }
}

pub struct Exporter {
    encoder: Arc<dyn LogsEncoder>,
    transport: Arc<dyn LogsTransport>,
    retry_strategy: RetryStrategy,
    attempt_timeout: Duration,
    diagnostics: Arc<dyn DiagnosticsSink>,
    attempts: AtomicU64,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("retry_strategy", &self.retry_strategy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    pub fn new(
        encoder: Arc<dyn LogsEncoder>,
        transport: Arc<dyn LogsTransport>,
        retry_strategy: RetryStrategy,
        attempt_timeout: Duration,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            encoder,
            transport,
            retry_strategy,
            attempt_timeout,
            diagnostics,
            attempts: AtomicU64::new(0),
        }
    }

    /// Total transport calls made so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Exports one batch, consuming it. Never panics on transport failure.
    pub async fn export(&self, batch: Batch) -> ExportResult {
        let sequence = batch.sequence();
        let records = batch.len();

        let payload = match self.encoder.encode(&batch) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                let reason = e.to_string();
                self.diagnostics.report(DiagnosticEvent::ExportFailed {
                    sequence,
                    records,
                    reason: reason.clone(),
                });
                return ExportResult::Failed(reason);
            }
        };
        // Records are no longer needed once serialized
        drop(batch);

        let max_attempts = self.retry_strategy.max_attempts().max(1);
        let mut state = ExportAttempt::new();

        loop {
            state.attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let sent = tokio::time::timeout(
                self.attempt_timeout,
                self.transport
                    .send(payload.clone(), self.encoder.content_type()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Transient(format!(
                    "export attempt timed out after {} ms",
                    self.attempt_timeout.as_millis()
                )))
            });

            match sent {
                Ok(()) => {
                    debug!(
                        "LOGS | Delivered batch {sequence} ({records} records) after {} attempt(s)",
                        state.attempt
                    );
                    return ExportResult::Delivered;
                }
                Err(TransportError::Permanent(reason)) => {
                    self.diagnostics.report(DiagnosticEvent::ExportFailed {
                        sequence,
                        records,
                        reason: reason.clone(),
                    });
                    return ExportResult::Failed(reason);
                }
                Err(TransportError::Transient(reason)) => {
                    if state.attempt >= max_attempts {
                        let reason = format!("failed after {} attempts: {reason}", state.attempt);
                        self.diagnostics.report(DiagnosticEvent::ExportDropped {
                            sequence,
                            records,
                            reason: reason.clone(),
                        });
                        return ExportResult::Dropped(reason);
                    }
                    state.next_delay = self.retry_strategy.delay_after(state.attempt);
                    self.diagnostics.report(DiagnosticEvent::ExportRetry {
                        sequence,
                        attempt: state.attempt,
                        delay: state.next_delay,
                        reason,
                    });
                    if !state.next_delay.is_zero() {
                        tokio::time::sleep(state.next_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::{LogRecord, ResourceAttributes, Severity};
    use crate::transport::JsonEncoder;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingDiagnostics {
        pub events: Mutex<Vec<DiagnosticEvent>>,
    }

    impl DiagnosticsSink for RecordingDiagnostics {
        fn report(&self, event: DiagnosticEvent) {
            self.events.lock().expect("lock poisoned").push(event);
        }
    }

    /// Replays a scripted sequence of results, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<(), TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl LogsTransport for ScriptedTransport {
        async fn send(
            &self,
            _payload: Bytes,
            _content_type: &'static str,
        ) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    struct BrokenEncoder;

    impl LogsEncoder for BrokenEncoder {
        fn content_type(&self) -> &'static str {
            "application/json"
        }
        fn encode(&self, _batch: &Batch) -> Result<Vec<u8>, EncodeError> {
            Err(EncodeError("unsupported value".to_string()))
        }
    }

    fn batch(n: usize) -> Batch {
        let records = (0..n)
            .map(|i| LogRecord::new(Severity::Information, format!("{i}")))
            .collect();
        Batch::new(0, records, Arc::new(ResourceAttributes::default()))
    }

    fn exporter(
        transport: Arc<ScriptedTransport>,
        retry_strategy: RetryStrategy,
    ) -> (Exporter, Arc<RecordingDiagnostics>) {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let exporter = Exporter::new(
            Arc::new(JsonEncoder),
            transport,
            retry_strategy,
            Duration::from_secs(5),
            diagnostics.clone(),
        );
        (exporter, diagnostics)
    }

    #[test]
    fn test_retry_strategy_delays() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(strategy.delay_after(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_after(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_after(4), Duration::from_millis(800));
        assert_eq!(strategy.delay_after(5), Duration::from_millis(1000));
        assert_eq!(strategy.delay_after(60), Duration::from_millis(1000));

        assert_eq!(RetryStrategy::LinearBackoff(3, 7).delay_after(2), Duration::from_millis(7));
        assert_eq!(RetryStrategy::Immediate(3).delay_after(2), Duration::ZERO);
        assert_eq!(RetryStrategy::default().max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_export_delivered_first_try() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (exporter, diagnostics) = exporter(transport.clone(), RetryStrategy::Immediate(3));

        assert_eq!(exporter.export(batch(2)).await, ExportResult::Delivered);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exporter.attempts(), 1);
        assert!(diagnostics.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_with_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Transient("connection refused".into())),
            Err(TransportError::Transient("503".into())),
        ]));
        let strategy = RetryStrategy::Exponential {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let (exporter, diagnostics) = exporter(transport.clone(), strategy);

        let start = Instant::now();
        assert_eq!(exporter.export(batch(1)).await, ExportResult::Delivered);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let events = diagnostics.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        let expected = Duration::from_millis(200);
        assert!(matches!(
            events[1],
            DiagnosticEvent::ExportRetry { attempt: 2, delay, .. } if delay == expected
        ));
    }

    #[tokio::test]
    async fn test_retries_exhausted_drops_batch() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Transient("timeout".into())),
            Err(TransportError::Transient("timeout".into())),
            Err(TransportError::Transient("timeout".into())),
        ]));
        let (exporter, diagnostics) = exporter(transport.clone(), RetryStrategy::Immediate(3));

        let result = exporter.export(batch(4)).await;
        assert!(
            matches!(result, ExportResult::Dropped(ref reason) if reason.contains("3 attempts"))
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let events = diagnostics.events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(DiagnosticEvent::ExportDropped { records: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Permanent(
            "401 Unauthorized".into(),
        ))]));
        let (exporter, diagnostics) = exporter(transport.clone(), RetryStrategy::Immediate(5));

        assert_eq!(
            exporter.export(batch(2)).await,
            ExportResult::Failed("401 Unauthorized".to_string())
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *diagnostics.events.lock().unwrap(),
            vec![DiagnosticEvent::ExportFailed {
                sequence: 0,
                records: 2,
                reason: "401 Unauthorized".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_encode_failure_is_permanent() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let exporter = Exporter::new(
            Arc::new(BrokenEncoder),
            transport.clone(),
            RetryStrategy::Immediate(3),
            Duration::from_secs(5),
            diagnostics,
        );

        let result = exporter.export(batch(1)).await;
        assert!(matches!(result, ExportResult::Failed(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_transport_times_out_as_transient() {
        struct HangingTransport;

        #[async_trait]
        impl LogsTransport for HangingTransport {
            async fn send(
                &self,
                _payload: Bytes,
                _content_type: &'static str,
            ) -> Result<(), TransportError> {
                std::future::pending().await
            }
        }

        let exporter = Exporter::new(
            Arc::new(JsonEncoder),
            Arc::new(HangingTransport),
            RetryStrategy::Immediate(2),
            Duration::from_secs(1),
            Arc::new(RecordingDiagnostics::default()),
        );
        let result = exporter.export(batch(1)).await;
        assert!(
            matches!(result, ExportResult::Dropped(ref reason) if reason.contains("timed out"))
        );
        assert_eq!(exporter.attempts(), 2);
    }
}
