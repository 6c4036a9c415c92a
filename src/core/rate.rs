//! Sliding-window byte rate of one decoder process.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Window over which the rate is averaged.
pub const RATE_WINDOW: Duration = Duration::from_secs(10);
/// Samples kept at most; older ones are dropped first.
pub const RATE_MAX_SAMPLES: usize = 100;
/// A lone sample younger than this is reported as a burst rate.
const SINGLE_SAMPLE_FRESHNESS: Duration = Duration::from_secs(5);

/// Bytes-per-second estimate over the last [`RATE_WINDOW`].
///
/// - no samples: `0.0`
/// - one sample: its size if younger than 5s, else `0.0`
/// - otherwise: total bytes over the span between the oldest and newest sample
#[derive(Debug, Default)]
pub struct DataRate {
    samples: VecDeque<(Instant, u64)>,
}

impl DataRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.prune(now);
        while self.samples.len() > RATE_MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let (Some(&(first, first_bytes)), Some(&(last, _))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        if self.samples.len() == 1 {
            if now.saturating_duration_since(first) < SINGLE_SAMPLE_FRESHNESS {
                return first_bytes as f64;
            }
            return 0.0;
        }
        let span = last.saturating_duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        total as f64 / span
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
