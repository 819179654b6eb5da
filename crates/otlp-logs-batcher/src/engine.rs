// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing facade and lifecycle of the batching engine.
//!
//! # States
//!
//! - **Running**: `enqueue` accepts records, the flush scheduler is active.
//! - **Draining**: entered by `shutdown`. New records are refused, everything pending
//!   is flushed, and the call waits for the exports to finish, bounded by its timeout.
//! - **Stopped**: terminal. Every `enqueue` fails.
//!
//! No error from the engine ever reaches a producer other than the boolean returned
//! by [`BatchEngine::enqueue`]. Export failures go to the [`DiagnosticsSink`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::BatchAccumulator;
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink, TracingDiagnostics};
use crate::error::{EngineError, EnqueueError};
use crate::exporter::{ExportResult, Exporter, LogsEncoder, LogsTransport};
use crate::queue::{Admission, RecordQueue};
use crate::record::LogRecord;
use crate::scheduler::FlushScheduler;
use crate::transport::{HttpTransport, JsonEncoder};
use crate::worker::{BatchWorker, ControlCommand, ExportWorker};

const CONTROL_CHANNEL_CAPACITY: usize = 16;
/// One batch waiting while another is in flight.
const EXPORT_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Running,
            1 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Running => 0,
            EngineState::Draining => 1,
            EngineState::Stopped => 2,
        }
    }
}

/// Point-in-time snapshot of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Records admitted to the queue
    pub enqueued: u64,
    /// Records refused because the queue was full
    pub rejected: u64,
    /// Records evicted from a full queue to admit newer ones
    pub evicted: u64,
    pub batches_cut: u64,
    pub delivered_records: u64,
    /// Records lost to non-retriable export failures
    pub failed_records: u64,
    /// Records lost to exhausted retries or abandoned at shutdown
    pub dropped_records: u64,
    pub export_attempts: u64,
}

/// State shared between the handle and the background workers.
#[derive(Debug)]
pub(crate) struct Shared {
    state: AtomicU8,
    queue: Arc<RecordQueue>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    overflow_reported: AtomicBool,
    /// Records cut into batches that have not reached a terminal result yet.
    pending_export: AtomicUsize,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    batches_cut: AtomicU64,
    delivered_records: AtomicU64,
    failed_records: AtomicU64,
    dropped_records: AtomicU64,
}

impl Shared {
    fn new(queue: Arc<RecordQueue>, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Running.as_u8()),
            queue,
            diagnostics,
            overflow_reported: AtomicBool::new(false),
            pending_export: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            batches_cut: AtomicU64::new(0),
            delivered_records: AtomicU64::new(0),
            failed_records: AtomicU64::new(0),
            dropped_records: AtomicU64::new(0),
        }
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn report_overflow_once(&self) {
        if !self.overflow_reported.swap(true, Ordering::Relaxed) {
            self.diagnostics.report(DiagnosticEvent::QueueOverflow {
                policy: self.queue.policy(),
            });
        }
    }

    pub(crate) fn report(&self, event: DiagnosticEvent) {
        self.diagnostics.report(event);
    }

    pub(crate) fn batch_cut(&self, records: usize) {
        self.batches_cut.fetch_add(1, Ordering::Relaxed);
        self.pending_export.fetch_add(records, Ordering::AcqRel);
    }

    pub(crate) fn export_finished(&self, records: usize, result: &ExportResult) {
        let counter = match result {
            ExportResult::Delivered => &self.delivered_records,
            ExportResult::Failed(_) => &self.failed_records,
            ExportResult::Dropped(_) => &self.dropped_records,
        };
        counter.fetch_add(records as u64, Ordering::Relaxed);
        self.pending_export.fetch_sub(records, Ordering::AcqRel);
    }

    pub(crate) fn abandon_pending(&self, records: usize) {
        self.dropped_records.fetch_add(records as u64, Ordering::Relaxed);
        self.pending_export.fetch_sub(records, Ordering::AcqRel);
    }
}

struct Workers {
    batch: JoinHandle<()>,
    export: JoinHandle<()>,
}

/// Builder for a [`BatchEngine`]; collaborators default to [`JsonEncoder`],
/// [`HttpTransport`] and [`TracingDiagnostics`].
pub struct BatchEngineBuilder {
    config: EngineConfig,
    encoder: Option<Arc<dyn LogsEncoder>>,
    transport: Option<Arc<dyn LogsTransport>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl BatchEngineBuilder {
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn LogsEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn LogsTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Validates the configuration and spawns the background workers on the current
    /// tokio runtime.
    pub fn start(self) -> Result<BatchEngine, EngineError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let encoder = self.encoder.unwrap_or_else(|| Arc::new(JsonEncoder));
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingDiagnostics));

        let queue = Arc::new(RecordQueue::new(
            config.batch_queue_limit,
            config.overflow_policy,
            config.batch_size_limit,
        ));
        let shared = Arc::new(Shared::new(Arc::clone(&queue), Arc::clone(&diagnostics)));
        let exporter = Arc::new(Exporter::new(
            encoder,
            transport,
            config.retry_strategy,
            config.export_timeout,
            diagnostics,
        ));

        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (export_tx, export_rx) = mpsc::channel(EXPORT_CHANNEL_CAPACITY);

        let batch_worker = BatchWorker {
            accumulator: BatchAccumulator::new(
                Arc::clone(&queue),
                config.batch_size_limit,
                Arc::new(config.resource_attributes.clone()),
                config.eager_first_flush,
            ),
            scheduler: FlushScheduler::new(config.batch_period, cancel.clone()),
            control_rx,
            export_tx,
            cancel: cancel.clone(),
            shared: Arc::clone(&shared),
        };
        let export_worker = ExportWorker {
            exporter: Arc::clone(&exporter),
            export_rx,
            shared: Arc::clone(&shared),
        };

        let workers = Workers {
            batch: runtime.spawn(batch_worker.run()),
            export: runtime.spawn(export_worker.run()),
        };

        info!(
            "LOGS | Batch engine started: endpoint={} batch_size_limit={} batch_period={}ms batch_queue_limit={}",
            config.endpoint,
            config.batch_size_limit,
            config.batch_period.as_millis(),
            config.batch_queue_limit
        );

        Ok(BatchEngine {
            shared,
            queue,
            exporter,
            control_tx,
            cancel,
            workers: TokioMutex::new(Some(workers)),
            drained: OnceLock::new(),
        })
    }
}

/// Owned handle to one engine instance. Dropping it without calling
/// [`BatchEngine::shutdown`] stops intake and lets the workers drain in the background.
pub struct BatchEngine {
    shared: Arc<Shared>,
    queue: Arc<RecordQueue>,
    exporter: Arc<Exporter>,
    control_tx: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
    workers: TokioMutex<Option<Workers>>,
    drained: OnceLock<bool>,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("state", &self.state())
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl BatchEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> BatchEngineBuilder {
        BatchEngineBuilder {
            config,
            encoder: None,
            transport: None,
            diagnostics: None,
        }
    }

    /// Starts an engine with the default encoder, transport and diagnostics.
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(config).start()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Non-blocking. Returns `false` if the record was not accepted; the record is lost.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        self.try_enqueue(record).is_ok()
    }

    /// Like [`BatchEngine::enqueue`] but says why a record was refused.
    pub fn try_enqueue(&self, record: LogRecord) -> Result<(), EnqueueError> {
        match self.shared.state() {
            EngineState::Running => {}
            EngineState::Draining => return Err(EnqueueError::Draining),
            EngineState::Stopped => return Err(EnqueueError::Stopped),
        }

        match self.queue.try_enqueue(record) {
            Admission::Accepted => {
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Admission::Evicted => {
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                self.shared.evicted.fetch_add(1, Ordering::Relaxed);
                self.shared.report_overflow_once();
                Ok(())
            }
            Admission::Rejected => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                self.shared.report_overflow_once();
                Err(EnqueueError::QueueOverflow)
            }
            // Lost the race against shutdown closing the queue
            Admission::Closed => match self.shared.state() {
                EngineState::Stopped => Err(EnqueueError::Stopped),
                _ => Err(EnqueueError::Draining),
            },
        }
    }

    /// Records currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.shared;
        EngineStats {
            enqueued: s.enqueued.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            evicted: s.evicted.load(Ordering::Relaxed),
            batches_cut: s.batches_cut.load(Ordering::Relaxed),
            delivered_records: s.delivered_records.load(Ordering::Relaxed),
            failed_records: s.failed_records.load(Ordering::Relaxed),
            dropped_records: s.dropped_records.load(Ordering::Relaxed),
            export_attempts: self.exporter.attempts(),
        }
    }

    /// Cuts everything pending and waits until those batches reached a terminal
    /// export result. Returns `false` on timeout or if the engine is not running.
    pub async fn force_flush(&self, timeout: Duration) -> bool {
        if self.state() != EngineState::Running {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = tokio::time::timeout_at(
            deadline,
            self.control_tx.send(ControlCommand::Flush(ack_tx)),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            return false;
        }
        matches!(tokio::time::timeout_at(deadline, ack_rx).await, Ok(Ok(())))
    }

    /// Stops intake, flushes everything pending and waits for the exports to finish.
    ///
    /// Never waits longer than `timeout`. When the deadline passes, in-flight and
    /// pending work is abandoned, counted as dropped and reported to diagnostics.
    /// Returns `true` when everything pending reached a terminal export result.
    /// Later calls return the outcome of the first one.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        // Held for the whole shutdown so a concurrent caller waits for the outcome
        let Ok(mut guard) = tokio::time::timeout_at(deadline, self.workers.lock()).await else {
            return false;
        };
        if !self
            .shared
            .transition(EngineState::Running, EngineState::Draining)
        {
            debug!("LOGS | Shutdown already requested");
            return self.drained.get().copied().unwrap_or(false);
        }

        info!(
            "LOGS | Shutting down batch engine, {} records pending",
            self.queue.len()
        );
        // Close before cancelling so the final drain sees every admitted record
        self.queue.close();
        self.cancel.cancel();

        let drained = match guard.take() {
            Some(mut workers) => {
                let finished = tokio::time::timeout_at(deadline, async {
                    let batch = (&mut workers.batch).await;
                    let export = (&mut workers.export).await;
                    batch.and(export)
                })
                .await;
                match finished {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!("LOGS | Batch engine worker failed: {e}");
                        self.abandon_remaining();
                        false
                    }
                    Err(_) => {
                        workers.batch.abort();
                        workers.export.abort();
                        // Aborted tasks resolve promptly; after this no worker touches the counters.
                        // A handle that already yielded its output must not be polled again.
                        for handle in [workers.batch, workers.export] {
                            if !handle.is_finished() {
                                let _ = handle.await;
                            }
                        }
                        self.abandon_remaining();
                        false
                    }
                }
            }
            None => false,
        };

        let rejected = self.shared.rejected.load(Ordering::Relaxed);
        let evicted = self.shared.evicted.load(Ordering::Relaxed);
        if rejected + evicted > 0 {
            warn!(
                "LOGS | {} records were lost to a full queue (capacity {}): {rejected} rejected, {evicted} evicted",
                rejected + evicted,
                self.queue.capacity()
            );
        }

        let _ = self.drained.set(drained);
        self.shared.set_state(EngineState::Stopped);
        drop(guard);
        info!("LOGS | Batch engine stopped (drained: {drained})");
        drained
    }

    fn abandon_remaining(&self) {
        let in_queue = self.queue.drain_all().len();
        let in_flight = self.shared.pending_export.swap(0, Ordering::AcqRel);
        let abandoned = in_queue + in_flight;
        self.shared
            .dropped_records
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        self.shared
            .diagnostics
            .report(DiagnosticEvent::ShutdownTimeout { abandoned });
    }
}

impl Drop for BatchEngine {
    fn drop(&mut self) {
        if self.shared.state() == EngineState::Running {
            self.queue.close();
            self.cancel.cancel();
        }
    }
}
