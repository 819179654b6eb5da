// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background tasks behind a [`crate::engine::BatchEngine`].
//!
//! ```text
//!   producers ──> RecordQueue ──> BatchWorker ──(bounded channel)──> ExportWorker ──> collector
//!                                   ^      ^
//!                      size trigger │      │ FlushScheduler tick / control commands
//! ```
//!
//! The batch worker is the only place batches are cut; the export worker is the only
//! caller of the [`Exporter`]. The channel between them holds a single batch, so the
//! next batch can be assembled while the previous one is in flight, but two exports
//! never overlap.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::accumulator::{BatchAccumulator, FlushTrigger};
use crate::diagnostics::DiagnosticEvent;
use crate::engine::Shared;
use crate::exporter::{ExportResult, Exporter};
use crate::record::Batch;
use crate::scheduler::FlushScheduler;

/// Commands from the engine handle to the batch worker.
#[derive(Debug)]
pub(crate) enum ControlCommand {
    /// Cut everything pending; the sender fires once those batches reached a
    /// terminal export result.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) enum ExportItem {
    Batch(Batch),
    /// Acknowledged once every batch sent before it was exported.
    Barrier(oneshot::Sender<()>),
}

pub(crate) struct BatchWorker {
    pub accumulator: BatchAccumulator,
    pub scheduler: FlushScheduler,
    pub control_rx: mpsc::Receiver<ControlCommand>,
    pub export_tx: mpsc::Sender<ExportItem>,
    pub cancel: CancellationToken,
    pub shared: Arc<Shared>,
}

impl BatchWorker {
    pub async fn run(mut self) {
        debug!("LOGS | Batch worker started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = self.control_rx.recv() => match command {
                    ControlCommand::Flush(ack) => {
                        self.submit_all(FlushTrigger::Forced).await;
                        if self.export_tx.send(ExportItem::Barrier(ack)).await.is_err() {
                            error!("LOGS | Export worker gone, cannot acknowledge flush");
                        }
                    }
                },
                () = self.accumulator.queue().size_reached() => {
                    while let Some(batch) = self.accumulator.cut_if_full() {
                        self.submit(batch).await;
                    }
                }
                Some(_) = self.scheduler.tick() => {
                    self.submit_all(FlushTrigger::Timer).await;
                }
            }
        }

        // A flush in progress when shutdown was requested has completed above; now
        // drain whatever is left. Dropping the sender lets the export worker finish.
        debug!(
            "LOGS | Batch worker draining {} pending records",
            self.accumulator.queue().len()
        );
        self.submit_all(FlushTrigger::Shutdown).await;
        debug!("LOGS | Batch worker stopped");
    }

    /// Cuts and hands off everything pending, one batch at a time. Bounded by the
    /// records pending on entry so a steady stream of producers cannot pin the worker.
    async fn submit_all(&mut self, trigger: FlushTrigger) {
        let mut remaining = self.accumulator.queue().len();
        while remaining > 0 {
            let Some(batch) = self.accumulator.cut(trigger) else {
                break;
            };
            remaining = remaining.saturating_sub(batch.len());
            self.submit(batch).await;
        }
    }

    async fn submit(&mut self, batch: Batch) {
        let records = batch.len();
        // Counted before the first await so an aborted send still accounts for the batch
        self.shared.batch_cut(records);
        let sent = self.export_tx.send(ExportItem::Batch(batch)).await;
        if let Err(mpsc::error::SendError(item)) = sent {
            // Only reachable if the export worker died; account for the records anyway
            if let ExportItem::Batch(batch) = item {
                error!(
                    "LOGS | Export worker gone, dropping batch {} with {records} records",
                    batch.sequence()
                );
            }
            self.shared.abandon_pending(records);
        }
    }
}

pub(crate) struct ExportWorker {
    pub exporter: Arc<Exporter>,
    pub export_rx: mpsc::Receiver<ExportItem>,
    pub shared: Arc<Shared>,
}

impl ExportWorker {
    pub async fn run(mut self) {
        debug!("LOGS | Export worker started");
        while let Some(item) = self.export_rx.recv().await {
            match item {
                ExportItem::Batch(batch) => {
                    let sequence = batch.sequence();
                    let records = batch.len();
                    let result = match self.export_isolated(batch).await {
                        Ok(result) => result,
                        Err(reason) => {
                            self.shared.report(DiagnosticEvent::ExportDropped {
                                sequence,
                                records,
                                reason: reason.clone(),
                            });
                            ExportResult::Dropped(reason)
                        }
                    };
                    self.shared.export_finished(records, &result);
                }
                ExportItem::Barrier(ack) => {
                    // The caller may have timed out already
                    let _ = ack.send(());
                }
            }
        }
        debug!("LOGS | Export worker stopped");
    }

    /// Runs one export in its own task so a panicking collaborator costs one batch,
    /// not the worker. The task is aborted with the worker.
    async fn export_isolated(&self, batch: Batch) -> Result<ExportResult, String> {
        let exporter = Arc::clone(&self.exporter);
        let mut task = JoinSet::new();
        task.spawn(async move { exporter.export(batch).await });
        match task.join_next().await {
            Some(Ok(result)) => Ok(result),
            Some(Err(e)) => {
                error!("LOGS | Export task failed: {e}");
                Err(format!("export task failed: {e}"))
            }
            None => Err("export task vanished".to_string()),
        }
    }
}
