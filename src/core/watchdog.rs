//! # Data staleness watchdog.
//!
//! [`Watchdog`] holds the "last data" timestamp of one stream. The read loop calls
//! [`Watchdog::update`] after every successful read; [`watch`] runs as a separate
//! task per process attempt and decides on each tick:
//!
//! ```text
//! tick ──► source still desired? ──no──► NoLongerDesired (silent)
//!                 │
//!                yes
//!                 ▼
//!     since last data > silence_timeout? ──yes──► TimedOut
//!                 │
//!                 no ──► keep ticking
//! ```
//!
//! The timestamp sits behind its own lock, independent from the supervisor's
//! restart state, and is only ever moved forward.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::source::DesiredSources;

/// Last-data timestamp of one stream.
#[derive(Debug)]
pub struct Watchdog {
    last_data: Mutex<Instant>,
}

/// Why a [`watch`] task finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No data for longer than the silence timeout.
    TimedOut(Duration),
    /// The source left the desired configuration.
    NoLongerDesired,
    /// The attempt ended for another reason.
    Cancelled,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            last_data: Mutex::new(Instant::now()),
        }
    }

    /// Marks data as received now.
    pub fn update(&self) {
        self.update_at(Instant::now());
    }

    /// Moves the timestamp to `at` unless it already is later.
    pub fn update_at(&self, at: Instant) {
        let mut last = self.last_data.lock().unwrap_or_else(|e| e.into_inner());
        if at > *last {
            *last = at;
        }
    }

    pub fn last_data(&self) -> Instant {
        *self.last_data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn time_since_last_data(&self) -> Duration {
        self.last_data().elapsed()
    }
}

/// Watches `watchdog` until the stream goes stale, leaves `desired`, or `token` is cancelled.
pub async fn watch(
    watchdog: &Watchdog,
    source_id: &str,
    desired: &DesiredSources,
    tick: Duration,
    silence_timeout: Duration,
    token: &CancellationToken,
) -> WatchdogOutcome {
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return WatchdogOutcome::Cancelled,
            _ = ticker.tick() => {
                if !desired.contains(source_id) {
                    return WatchdogOutcome::NoLongerDesired;
                }
                let since = watchdog.time_since_last_data();
                if since > silence_timeout {
                    return WatchdogOutcome::TimedOut(since);
                }
            }
        }
    }
}
