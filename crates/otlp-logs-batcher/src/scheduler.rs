// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodic flush trigger, independent of record arrival.
///
/// Ticks are delivered to a single owner, so a timer-driven flush can never overlap
/// another one. If a flush runs longer than the period the missed ticks are not
/// replayed in a burst; the next tick is scheduled a full period later.
#[derive(Debug)]
pub struct FlushScheduler {
    interval: Interval,
    period: Duration,
    cancel: CancellationToken,
}

impl FlushScheduler {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        // interval() fires immediately; the first flush is due one period from now
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            period,
            cancel,
        }
    }

    /// Waits for the next tick. Returns `None` once the scheduler was cancelled.
    pub async fn tick(&mut self) -> Option<Instant> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            at = self.interval.tick() => Some(at),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_a_full_period() {
        let start = Instant::now();
        let mut scheduler = FlushScheduler::new(Duration::from_secs(2), CancellationToken::new());

        scheduler.tick().await.expect("tick");
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        scheduler.tick().await.expect("tick");
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let cancel = CancellationToken::new();
        let mut scheduler = FlushScheduler::new(Duration::from_secs(2), cancel.clone());

        let waiter = tokio::spawn(async move { scheduler.tick().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        assert!(waiter.await.expect("join").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flush_does_not_burst() {
        let start = Instant::now();
        let mut scheduler = FlushScheduler::new(Duration::from_secs(1), CancellationToken::new());

        scheduler.tick().await.expect("tick");
        // Simulate a flush that overruns three periods
        tokio::time::sleep(Duration::from_millis(3500)).await;

        // The overdue tick fires right away, then the schedule restarts from there
        scheduler.tick().await.expect("tick");
        let overdue = start.elapsed();
        scheduler.tick().await.expect("tick");
        assert_eq!(start.elapsed() - overdue, Duration::from_secs(1));
        assert!(scheduler.period() == Duration::from_secs(1));
        assert!(!scheduler.is_cancelled());
    }
}
