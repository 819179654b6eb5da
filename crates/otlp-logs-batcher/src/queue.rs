// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO buffer between producers and the background worker.
//!
//! Producers only ever take a short, uncontended-in-the-common-case lock to push a
//! record. When the number of pending records reaches the flush threshold the
//! worker is woken through a [`Notify`] so a size-triggered batch can be cut
//! without waiting for the next timer tick.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::record::LogRecord;

/// What happens when a record arrives and the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// The new record is refused and lost.
    Reject,
    /// The oldest pending record is evicted to make room.
    #[default]
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

/// Result of [`RecordQueue::try_enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Accepted after evicting the oldest pending record.
    Evicted,
    /// Queue full under [`OverflowPolicy::Reject`].
    Rejected,
    /// Queue closed for shutdown.
    Closed,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted | Admission::Evicted)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    records: VecDeque<LogRecord>,
    closed: bool,
}

#[derive(Debug)]
pub struct RecordQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Pending count at which the worker is woken for a size-triggered flush.
    flush_threshold: AtomicUsize,
    size_trigger: Notify,
}

impl RecordQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, flush_threshold: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            policy,
            flush_threshold: AtomicUsize::new(flush_threshold.max(1)),
            size_trigger: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A producer panicking mid-push cannot leave the deque inconsistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking insert. Never waits on anything but the internal lock.
    pub fn try_enqueue(&self, record: LogRecord) -> Admission {
        let (admission, pending) = {
            let mut state = self.lock();
            if state.closed {
                return Admission::Closed;
            }
            let admission = if state.records.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::Reject => return Admission::Rejected,
                    OverflowPolicy::DropOldest => {
                        state.records.pop_front();
                        Admission::Evicted
                    }
                }
            } else {
                Admission::Accepted
            };
            state.records.push_back(record);
            (admission, state.records.len())
        };

        if pending >= self.flush_threshold.load(Ordering::Acquire) {
            self.size_trigger.notify_one();
        }
        admission
    }

    /// Removes up to `n` records in FIFO order. Returns fewer if fewer are pending.
    pub fn dequeue_up_to(&self, n: usize) -> Vec<LogRecord> {
        let mut state = self.lock();
        let take = n.min(state.records.len());
        state.records.drain(..take).collect()
    }

    /// Takes every pending record, used when work is abandoned at shutdown.
    pub fn drain_all(&self) -> Vec<LogRecord> {
        let mut state = self.lock();
        state.records.drain(..).collect()
    }

    /// Refuses all further inserts. Records already pending stay until dequeued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.size_trigger.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn set_flush_threshold(&self, threshold: usize) {
        self.flush_threshold.store(threshold.max(1), Ordering::Release);
        if self.len() >= threshold.max(1) {
            self.size_trigger.notify_one();
        }
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold.load(Ordering::Acquire)
    }

    /// Resolves once the pending count has reached the flush threshold (or the
    /// queue was closed) since the last time a waiter was woken.
    pub fn size_reached(&self) -> Notified<'_> {
        self.size_trigger.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Severity;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(n: usize) -> LogRecord {
        LogRecord::new(Severity::Information, format!("message {n}"))
    }

    fn templates(records: &[LogRecord]) -> Vec<String> {
        records.iter().map(|r| r.message_template.clone()).collect()
    }

    #[test]
    fn test_dequeue_preserves_fifo_order() {
        let queue = RecordQueue::new(10, OverflowPolicy::Reject, 10);
        for i in 0..5 {
            assert_eq!(queue.try_enqueue(record(i)), Admission::Accepted);
        }

        let first = queue.dequeue_up_to(3);
        assert_eq!(templates(&first), vec!["message 0", "message 1", "message 2"]);

        // Fewer pending than requested returns what is there
        let rest = queue.dequeue_up_to(10);
        assert_eq!(templates(&rest), vec!["message 3", "message 4"]);
        assert!(queue.dequeue_up_to(10).is_empty());
    }

    #[test]
    fn test_reject_policy_refuses_when_full() {
        let queue = RecordQueue::new(2, OverflowPolicy::Reject, 2);
        assert!(queue.try_enqueue(record(0)).is_accepted());
        assert!(queue.try_enqueue(record(1)).is_accepted());
        assert_eq!(queue.try_enqueue(record(2)), Admission::Rejected);
        assert_eq!(queue.len(), 2);

        let pending = queue.dequeue_up_to(10);
        assert_eq!(templates(&pending), vec!["message 0", "message 1"]);
    }

    #[test]
    fn test_drop_oldest_policy_evicts_front() {
        let queue = RecordQueue::new(2, OverflowPolicy::DropOldest, 2);
        queue.try_enqueue(record(0));
        queue.try_enqueue(record(1));
        assert_eq!(queue.try_enqueue(record(2)), Admission::Evicted);
        assert_eq!(queue.len(), 2);

        let pending = queue.dequeue_up_to(10);
        assert_eq!(templates(&pending), vec!["message 1", "message 2"]);
    }

    #[test]
    fn test_closed_queue_refuses_records_but_keeps_pending() {
        let queue = RecordQueue::new(4, OverflowPolicy::Reject, 4);
        queue.try_enqueue(record(0));
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.try_enqueue(record(1)), Admission::Closed);
        assert_eq!(templates(&queue.drain_all()), vec!["message 0"]);
    }

    #[test]
    fn test_overflow_policy_from_str() {
        assert_eq!("reject".parse(), Ok(OverflowPolicy::Reject));
        assert_eq!("Drop_Oldest".parse(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("drop-oldest".parse(), Ok(OverflowPolicy::DropOldest));
        assert!("block".parse::<OverflowPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_size_reached_fires_at_threshold() {
        let queue = RecordQueue::new(10, OverflowPolicy::Reject, 3);
        queue.try_enqueue(record(0));
        queue.try_enqueue(record(1));

        let early = tokio::time::timeout(Duration::from_millis(20), queue.size_reached()).await;
        assert!(early.is_err(), "woken before threshold");

        queue.try_enqueue(record(2));
        tokio::time::timeout(Duration::from_millis(100), queue.size_reached())
            .await
            .expect("threshold notification");
    }

    #[tokio::test]
    async fn test_lowering_threshold_wakes_waiter() {
        let queue = RecordQueue::new(10, OverflowPolicy::Reject, 5);
        queue.try_enqueue(record(0));
        queue.set_flush_threshold(1);
        assert_eq!(queue.flush_threshold(), 1);
        tokio::time::timeout(Duration::from_millis(100), queue.size_reached())
            .await
            .expect("threshold notification");
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(RecordQueue::new(100, OverflowPolicy::DropOldest, 100));
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        assert!(queue.try_enqueue(record(p * 1000 + i)).is_accepted());
                        assert!(queue.len() <= 100);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread");
        }
        assert_eq!(queue.len(), 100);
    }
}
