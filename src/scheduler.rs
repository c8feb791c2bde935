//! Timer scheduler: the one periodic driver behind every poll countdown.
//!
//! DESIGN
//! ======
//! A single `tokio::time::Interval` owned by the session task. The session
//! loop awaits [`TimerScheduler::tick`] in its `select!`; when stopped, the
//! future never resolves, so an idle room causes no wakeups.
//!
//! `Interval::tick` is cancel-safe: if another branch of the loop wins, the
//! tick is not consumed. The countdown mutation runs synchronously after the
//! await returns, so a tick is applied to every active poll or not at all.
//!
//! TRADE-OFFS
//! ==========
//! Missed ticks are skipped rather than replayed. In fixed countdown mode this
//! means a stalled process lengthens polls; `CountdownMode::WallClock`
//! corrects for that at each tick.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

pub struct TimerScheduler {
    period: Duration,
    interval: Option<Interval>,
}

impl TimerScheduler {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period, interval: None }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Start ticking one period from now. No-op if already running.
    pub fn start(&mut self) {
        if self.interval.is_some() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
        debug!(period_ms = self.period.as_millis(), "countdown scheduler started");
    }

    /// Stop ticking. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            debug!("countdown scheduler stopped");
        }
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;
