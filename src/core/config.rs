//! # Stream and manager configuration.
//!
//! Provides [`StreamConfig`] (per-supervisor timings) and [`ManagerConfig`]
//! (registry-wide settings). Both are plain structs with documented defaults;
//! loading them from files is left to the embedding application.
//!
//! ## Sentinel values
//! - `monitor_interval = 0s` → health monitor disabled
//! - `grace = 0s` → shutdown does not wait for cleanups

use std::time::Duration;

use crate::policies::{BackoffPolicy, CircuitBreakerPolicy};

/// Timings and sizes governing one stream supervisor.
///
/// ## Notes
/// All fields are public. Prefer the helper accessors over sprinkling sentinel
/// checks across the codebase.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Size of one read from the decoder's output.
    pub read_buffer_size: usize,

    /// How often the watchdog checks for staleness.
    pub watchdog_tick: Duration,

    /// Time without data after which the watchdog fires.
    pub silence_timeout: Duration,

    /// A stream is healthy iff its last data is younger than this.
    pub healthy_threshold: Duration,

    /// A stream is "receiving data" iff its last data is younger than this.
    pub receiving_threshold: Duration,

    /// Output closing before this uptime is reported as a fast exit.
    pub fast_exit_threshold: Duration,

    /// Graceful wait during cleanup before the process group is force-killed.
    pub cleanup_timeout: Duration,

    /// Bounded wait for the reaper after a forced kill.
    pub reap_timeout: Duration,

    /// Delays between restarts and spawn retries.
    pub backoff: BackoffPolicy,

    /// Stability period after which the restart count starts over.
    pub restart_reset_window: Duration,

    /// Number of state transitions kept per supervisor.
    pub history_capacity: usize,

    /// Minimum spacing between repeated warnings (dropped output, missing processor).
    pub drop_log_interval: Duration,

    /// Uptime before the health monitor may restart an unhealthy stream.
    pub output_grace_period: Duration,

    /// Uptime during which stderr is scanned for known decoder failures (`0s` = off).
    pub early_error_window: Duration,

    /// How often stderr is scanned inside the early error window.
    pub early_error_poll: Duration,

    /// Consecutive permanent failures (bad credentials, missing stream) after which
    /// the supervisor gives up (`0` = never).
    pub permanent_failure_limit: u32,

    /// Cooldown after rapid repeated failures (`None` = off).
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl Default for StreamConfig {
    /// Default configuration:
    ///
    /// - `read_buffer_size = 32 KiB`
    /// - `watchdog_tick = 5s`, `silence_timeout = 60s`
    /// - `healthy_threshold = 60s`, `receiving_threshold = 5s`
    /// - `fast_exit_threshold = 5s`
    /// - `cleanup_timeout = 10s`, `reap_timeout = 5s`
    /// - `backoff = 5s × 2^(n-1)` capped at 2m, no jitter
    /// - `restart_reset_window = 60s`
    /// - `history_capacity = 100`
    /// - `drop_log_interval = 30s`, `output_grace_period = 30s`
    /// - `early_error_window = 5s`, `early_error_poll = 500ms`
    /// - `permanent_failure_limit = 0` (never give up)
    /// - `circuit_breaker = None`
    fn default() -> Self {
        Self {
            read_buffer_size: 32 * 1024,
            watchdog_tick: Duration::from_secs(5),
            silence_timeout: Duration::from_secs(60),
            healthy_threshold: Duration::from_secs(60),
            receiving_threshold: Duration::from_secs(5),
            fast_exit_threshold: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(10),
            reap_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            restart_reset_window: Duration::from_secs(60),
            history_capacity: 100,
            drop_log_interval: Duration::from_secs(30),
            output_grace_period: Duration::from_secs(30),
            early_error_window: Duration::from_secs(5),
            early_error_poll: Duration::from_millis(500),
            permanent_failure_limit: 0,
            circuit_breaker: None,
        }
    }
}

impl StreamConfig {
    /// Read buffer size clamped to at least 1 byte.
    #[inline]
    pub fn read_buffer_size_clamped(&self) -> usize {
        self.read_buffer_size.max(1)
    }

    /// Watchdog tick clamped to at least 1ms.
    #[inline]
    pub fn watchdog_tick_clamped(&self) -> Duration {
        self.watchdog_tick.max(Duration::from_millis(1))
    }

    /// Early stderr scanning as `(window, poll)`, or `None` when disabled.
    #[inline]
    pub fn early_error_check(&self) -> Option<(Duration, Duration)> {
        if self.early_error_window.is_zero() {
            None
        } else {
            Some((
                self.early_error_window,
                self.early_error_poll.max(Duration::from_millis(10)),
            ))
        }
    }

    pub(crate) fn cleanup_limits(&self) -> crate::process::CleanupLimits {
        crate::process::CleanupLimits {
            cleanup_timeout: self.cleanup_timeout,
            reap_timeout: self.reap_timeout,
        }
    }
}

/// Settings for the [`SupervisorManager`](crate::SupervisorManager).
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Applied to every supervisor the manager creates.
    pub stream: StreamConfig,

    /// Period of the health monitor sweep (`0s` = disabled).
    pub monitor_interval: Duration,

    /// Maximum wait for all supervisors during shutdown.
    pub grace: Duration,

    /// Capacity of the event bus ring buffer (min 1).
    pub bus_capacity: usize,
}

impl Default for ManagerConfig {
    /// - `stream = StreamConfig::default()`
    /// - `monitor_interval = 30s`
    /// - `grace = 10s`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            monitor_interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
            bus_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Returns the monitor interval, or `None` when the monitor is disabled.
    #[inline]
    pub fn monitor_interval(&self) -> Option<Duration> {
        if self.monitor_interval.is_zero() {
            None
        } else {
            Some(self.monitor_interval)
        }
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}
