//! # Restart tracking for one supervisor instance.
//!
//! [`RestartTracker`] counts restarts of a decoder process and remembers when the last
//! one happened. The count feeds [`BackoffPolicy::next`](crate::BackoffPolicy::next).
//!
//! ## Reset window
//! ```text
//! record() ──► elapsed since last restart > window ? ──yes──► count = 0
//!                                                   │
//!                                                   └──────► count += 1
//! ```
//! A source that fails occasionally keeps a short backoff; one that fails
//! continuously climbs until the backoff saturates at its cap.
//!
//! Trackers are never shared: each supervisor instance owns its own, so two
//! generations of the same source (e.g. before and after a transport change)
//! never see each other's counters.

use std::time::Duration;

use tokio::time::Instant;

/// Restart counter with a stability reset window.
#[derive(Clone, Debug)]
pub struct RestartTracker {
    window: Duration,
    count: u32,
    last_restart: Option<Instant>,
}

impl RestartTracker {
    /// Creates a tracker that forgets previous restarts after `window` of stability.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            count: 0,
            last_restart: None,
        }
    }

    /// Records a restart now and returns the updated count.
    pub fn record(&mut self) -> u32 {
        self.record_at(Instant::now())
    }

    /// Records a restart at `now` and returns the updated count.
    pub fn record_at(&mut self, now: Instant) -> u32 {
        if let Some(last) = self.last_restart {
            if now.saturating_duration_since(last) > self.window {
                self.count = 0;
            }
        }
        self.count = self.count.saturating_add(1);
        self.last_restart = Some(now);
        self.count
    }

    /// Current restart count.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Time of the most recent restart, if any.
    #[inline]
    pub fn last_restart(&self) -> Option<Instant> {
        self.last_restart
    }

    /// Forgets all recorded restarts.
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_restart = None;
    }
}
