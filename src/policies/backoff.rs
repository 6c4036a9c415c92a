//! # Backoff policy for restarting decoder processes.
//!
//! [`BackoffPolicy`] controls how restart delays grow after repeated failures.
//! It is parameterized by:
//! - [`BackoffPolicy::base`] the delay used for the first retry;
//! - [`BackoffPolicy::max`] the maximum delay cap;
//! - [`BackoffPolicy::jitter`] optional randomization applied after the cap.
//!
//! The delay for attempt `n` (1-based) is `base × 2^(n-1)`, clamped to `max`.
//! The policy itself is a pure function of the attempt number. [`Backoff`] pairs a
//! policy with the attempt counter that the spawn-retry path advances and resets.
//!
//! There is no attempt limit: a source may become reachable again at any time,
//! so retries continue until the stream is stopped.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use streamvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     base: Duration::from_secs(5),
//!     max: Duration::from_secs(120),
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(1), Duration::from_secs(5));
//! assert_eq!(backoff.next(2), Duration::from_secs(10));
//! assert_eq!(backoff.next(11), Duration::from_secs(120));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Largest exponent applied to `base`; anything beyond overflows any sane cap anyway.
const MAX_EXPONENT: u32 = 31;

/// Restart backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Maximum delay cap for retries.
    pub max: Duration,
    /// Jitter applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `base = 5s`;
    /// - `max = 2m`;
    /// - `jitter = None`.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(120),
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (1-based).
    ///
    /// Attempt `0` is treated like attempt `1`. The base delay doubles with each attempt
    /// and saturates at [`BackoffPolicy::max`]; jitter is applied to the saturated value.
    pub fn next(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base_delay(attempt))
    }

    /// Delay for `attempt` before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Stateful wrapper over [`BackoffPolicy`] tracking consecutive spawn failures.
///
/// ### Rules
/// - [`Backoff::next_delay`] advances the counter, then computes the delay.
/// - [`Backoff::reset`] is called after any successful start and on every
///   explicitly requested restart.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh backoff with the attempt counter at zero.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advances the attempt counter and returns the delay for it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.next(self.attempt)
    }

    /// Zeroes the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(120),
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn test_first_attempt_returns_base() {
        assert_eq!(policy().next(1), Duration::from_secs(5));
        assert_eq!(policy().next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy();
        assert_eq!(p.next(2), Duration::from_secs(10));
        assert_eq!(p.next(3), Duration::from_secs(20));
        assert_eq!(p.next(4), Duration::from_secs(40));
        assert_eq!(p.next(5), Duration::from_secs(80));
        assert_eq!(p.next(6), Duration::from_secs(120));
    }

    #[test]
    fn test_saturates_above_ten_attempts() {
        let p = policy();
        for attempt in 11..200 {
            assert_eq!(p.next(attempt), p.max, "attempt {attempt} should saturate");
        }
        assert_eq!(p.next(u32::MAX), p.max);
    }

    #[test]
    fn test_base_exceeds_max() {
        let p = BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(5),
            jitter: JitterPolicy::None,
        };
        assert_eq!(p.next(1), Duration::from_secs(5));
    }

    #[test]
    fn test_stateful_backoff_resets() {
        let mut b = Backoff::new(policy());
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.attempt(), 2);

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_proportional_jitter_stays_within_band() {
        let p = BackoffPolicy {
            jitter: JitterPolicy::Proportional { max_percent: 20 },
            ..policy()
        };
        for _ in 0..100 {
            let d = p.next(1);
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_secs(6));
        }
    }
}
