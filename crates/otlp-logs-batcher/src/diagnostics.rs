// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Side channel for failures that must never reach the producing application.

use std::fmt::Debug;
use std::time::Duration;
use tracing::{error, warn};

use crate::queue::OverflowPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// First record lost to a full queue. Later losses are only counted.
    QueueOverflow { policy: OverflowPolicy },
    /// A transient failure; the batch will be tried again after `delay`.
    ExportRetry {
        sequence: u64,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Non-retriable failure, the batch was discarded.
    ExportFailed {
        sequence: u64,
        records: usize,
        reason: String,
    },
    /// Retries exhausted, the batch was discarded.
    ExportDropped {
        sequence: u64,
        records: usize,
        reason: String,
    },
    /// Shutdown deadline elapsed with work still pending.
    ShutdownTimeout { abandoned: usize },
}

pub trait DiagnosticsSink: Send + Sync + Debug {
    fn report(&self, event: DiagnosticEvent);
}

/// Default sink, writes every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::QueueOverflow { policy } => warn!(
                "LOGS | Record queue full ({policy:?}), dropping records. Further drops are counted and reported at shutdown"
            ),
            DiagnosticEvent::ExportRetry {
                sequence,
                attempt,
                delay,
                reason,
            } => warn!(
                "LOGS | Export of batch {sequence} failed on attempt {attempt}, retrying in {} ms: {reason}",
                delay.as_millis()
            ),
            DiagnosticEvent::ExportFailed {
                sequence,
                records,
                reason,
            } => error!("LOGS | Batch {sequence} rejected, {records} records lost: {reason}"),
            DiagnosticEvent::ExportDropped {
                sequence,
                records,
                reason,
            } => error!(
                "LOGS | Batch {sequence} dropped after exhausting retries, {records} records lost: {reason}"
            ),
            DiagnosticEvent::ShutdownTimeout { abandoned } => error!(
                "LOGS | Shutdown timed out, abandoning {abandoned} pending records"
            ),
        }
    }
}
