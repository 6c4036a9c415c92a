//! # Circuit breaker for decoders that keep failing.
//!
//! Backoff alone slows a failing source down gradually. [`CircuitBreaker`] stops it
//! outright for a cooldown once failures pile up, and it trips sooner the shorter
//! each failed process lived:
//!
//! | process runtime   | failures to open (defaults) |
//! |-------------------|-----------------------------|
//! | `< 1s`            | 3                           |
//! | `< 5s`            | 5                           |
//! | `< 30s`           | 8                           |
//! | any               | 10                          |
//!
//! While open, the supervisor waits out the remaining cooldown instead of the backoff
//! delay. The breaker closes (and forgets its failures) once the cooldown elapses.
//! A process that ran long enough and delivered enough bytes also clears the count.
//!
//! The breaker is opt-in ([`StreamConfig::circuit_breaker`](crate::StreamConfig)).

use std::time::Duration;

use tokio::time::Instant;

/// Thresholds of the circuit breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit regardless of runtime.
    pub threshold: u32,
    /// How long the circuit stays open.
    pub cooldown: Duration,
    /// Runtime below which a failure counts as immediate.
    pub immediate_runtime: Duration,
    /// Failures that open the circuit when the last one was immediate.
    pub immediate_threshold: u32,
    /// Runtime below which a failure counts as rapid.
    pub rapid_runtime: Duration,
    pub rapid_threshold: u32,
    /// Runtime below which a failure counts as quick.
    pub quick_runtime: Duration,
    pub quick_threshold: u32,
    /// Minimum runtime of a process considered stable.
    pub stable_runtime: Duration,
    /// Minimum bytes delivered by a process considered stable.
    pub stable_bytes: u64,
}

impl Default for CircuitBreakerPolicy {
    /// threshold 10, cooldown 30s; 3 failures under 1s, 5 under 5s, 8 under 30s;
    /// stable after 30s and 100 KiB.
    fn default() -> Self {
        Self {
            threshold: 10,
            cooldown: Duration::from_secs(30),
            immediate_runtime: Duration::from_secs(1),
            immediate_threshold: 3,
            rapid_runtime: Duration::from_secs(5),
            rapid_threshold: 5,
            quick_runtime: Duration::from_secs(30),
            quick_threshold: 8,
            stable_runtime: Duration::from_secs(30),
            stable_bytes: 100 * 1024,
        }
    }
}

impl CircuitBreakerPolicy {
    /// Reason the circuit opens after `failures` consecutive failures, the last of
    /// which ran for `runtime`. `None` keeps it closed.
    pub fn trip_reason(&self, failures: u32, runtime: Duration) -> Option<&'static str> {
        if runtime < self.immediate_runtime && failures >= self.immediate_threshold {
            Some("immediate_failures")
        } else if runtime < self.rapid_runtime && failures >= self.rapid_threshold {
            Some("rapid_failures")
        } else if runtime < self.quick_runtime && failures >= self.quick_threshold {
            Some("quick_failures")
        } else if failures >= self.threshold {
            Some("consecutive_failures")
        } else {
            None
        }
    }
}

/// Consecutive-failure counter with an open/closed cooldown state.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            opened_at: None,
        }
    }

    /// Records a failed process that ran for `runtime`.
    ///
    /// Returns the trip reason when this failure opened the circuit.
    pub fn record_failure(&mut self, runtime: Duration) -> Option<&'static str> {
        self.record_failure_at(Instant::now(), runtime)
    }

    pub fn record_failure_at(&mut self, now: Instant, runtime: Duration) -> Option<&'static str> {
        self.failures = self.failures.saturating_add(1);
        if self.opened_at.is_some() {
            return None;
        }
        let reason = self.policy.trip_reason(self.failures, runtime)?;
        self.opened_at = Some(now);
        Some(reason)
    }

    /// Opens the circuit now regardless of the count (permanent failures).
    pub fn trip(&mut self) {
        self.trip_at(Instant::now());
    }

    pub fn trip_at(&mut self, now: Instant) {
        self.failures = self.failures.max(self.policy.threshold);
        self.opened_at = Some(now);
    }

    /// Remaining cooldown, or `None` when closed. Closes the circuit once the
    /// cooldown has elapsed.
    pub fn remaining(&mut self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&mut self, now: Instant) -> Option<Duration> {
        let opened = self.opened_at?;
        let elapsed = now.saturating_duration_since(opened);
        if elapsed >= self.policy.cooldown {
            self.opened_at = None;
            self.failures = 0;
            return None;
        }
        Some(self.policy.cooldown - elapsed)
    }

    /// Clears the count when a process ran long enough and delivered enough bytes.
    /// Returns `true` if there was anything to clear.
    pub fn record_stable(&mut self, runtime: Duration, bytes: u64) -> bool {
        if runtime < self.policy.stable_runtime || bytes < self.policy.stable_bytes {
            return false;
        }
        let had = self.failures > 0;
        self.failures = 0;
        had
    }

    #[inline]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    #[inline]
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }
}
