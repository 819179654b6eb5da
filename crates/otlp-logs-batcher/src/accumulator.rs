// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns queued records into discrete batches.
//!
//! # Flush triggers
//!
//! 1. **Size**: as soon as `batch_size_limit` records are pending, a full batch is cut.
//! 2. **Timer**: on every scheduler tick whatever is pending is cut, split into
//!    batches of at most `batch_size_limit` records. Nothing pending means no batch.
//! 3. **Forced / shutdown**: same as the timer, on demand.
//!
//! With `eager_first_flush` the size threshold starts at one record and is raised
//! to `batch_size_limit` once the first batch has been cut.
//!
//! The accumulator is owned by a single worker and every cut takes `&mut self`, so
//! at most one batch is ever being assembled at a time.

use std::sync::Arc;
use tracing::debug;

use crate::queue::RecordQueue;
use crate::record::{Batch, ResourceAttributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Forced,
    Shutdown,
}

#[derive(Debug)]
pub struct BatchAccumulator {
    queue: Arc<RecordQueue>,
    batch_size_limit: usize,
    resource: Arc<ResourceAttributes>,
    eager_pending: bool,
    next_sequence: u64,
}

impl BatchAccumulator {
    pub fn new(
        queue: Arc<RecordQueue>,
        batch_size_limit: usize,
        resource: Arc<ResourceAttributes>,
        eager_first_flush: bool,
    ) -> Self {
        let batch_size_limit = batch_size_limit.max(1);
        queue.set_flush_threshold(if eager_first_flush {
            1
        } else {
            batch_size_limit
        });
        Self {
            queue,
            batch_size_limit,
            resource,
            eager_pending: eager_first_flush,
            next_sequence: 0,
        }
    }

    /// True when enough records are pending for a size-triggered cut.
    pub fn size_threshold_reached(&self) -> bool {
        self.queue.len() >= self.queue.flush_threshold()
    }

    /// Cuts at most one batch of up to `batch_size_limit` records.
    ///
    /// Returns `None` when nothing is pending, a batch is never empty.
    pub fn cut(&mut self, trigger: FlushTrigger) -> Option<Batch> {
        let records = self.queue.dequeue_up_to(self.batch_size_limit);
        if records.is_empty() {
            return None;
        }

        if self.eager_pending {
            self.eager_pending = false;
            self.queue.set_flush_threshold(self.batch_size_limit);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(
            "LOGS | Cut batch {sequence} with {} records ({trigger:?})",
            records.len()
        );
        Some(Batch::new(sequence, records, Arc::clone(&self.resource)))
    }

    /// Cuts one full batch if the size threshold is reached.
    ///
    /// Callers hand each batch off before cutting the next, so records never sit in
    /// a batch that nothing has accounted for yet.
    pub fn cut_if_full(&mut self) -> Option<Batch> {
        if self.size_threshold_reached() {
            self.cut(FlushTrigger::Size)
        } else {
            None
        }
    }

    pub fn batch_size_limit(&self) -> usize {
        self.batch_size_limit
    }

    pub fn batches_cut(&self) -> u64 {
        self.next_sequence
    }

    pub fn queue(&self) -> &Arc<RecordQueue> {
        &self.queue
    }
}
