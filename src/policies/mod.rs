//! Retry and restart policies.
//!
//! This module groups the knobs that control **how long** a supervisor waits
//! before bringing a decoder process back.
//!
//! ## Contents
//! - [`BackoffPolicy`] delay for attempt `n`: `base × 2^(n-1)` capped at `max`, plus jitter
//! - [`Backoff`] attempt counter over a policy, used by the spawn-retry path
//! - [`JitterPolicy`] randomization strategy to avoid thundering herd
//! - [`RestartTracker`] restart count with a stability reset window
//! - [`CircuitBreakerPolicy`], [`CircuitBreaker`] optional cooldown after rapid repeated failures
//!
//! ## Quick wiring
//! ```text
//! StreamConfig { backoff: BackoffPolicy, restart_reset_window }
//!      └─► core::StreamSupervisor uses:
//!           - Backoff for spawn failures (reset on successful start / explicit restart)
//!           - RestartTracker + backoff.next(count) for watchdog and exit restarts
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → base=5s, max=2m, jitter=None.
//! - `JitterPolicy::None` by default; `Proportional { max_percent: 20 }` spreads
//!   restarts of many streams.

mod backoff;
mod circuit;
mod jitter;
mod restart;

pub use backoff::{Backoff, BackoffPolicy};
pub use circuit::{CircuitBreaker, CircuitBreakerPolicy};
pub use jitter::JitterPolicy;
pub use restart::RestartTracker;
