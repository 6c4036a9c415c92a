//! # Supervision events emitted by stream supervisors and the manager.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Registry events**: streams entering and leaving the manager
//! - **Process events**: spawn, exit, cleanup of one decoder process
//! - **Restart events**: watchdog timeouts, restart requests, backoff waits
//! - **Shutdown events**: manager-wide stop and its grace outcome
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use streamvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_source("rtsp://10.0.0.5/stream1")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_secs(20));
//!
//! assert_eq!(ev.kind, EventKind::BackoffScheduled);
//! assert_eq!(ev.delay_ms, Some(20_000));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::ProcessState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of supervision events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Registry events ===
    /// A supervisor was registered for a source.
    ///
    /// Sets: `source`, `instance`, `reason` (transport).
    StreamAdded,

    /// A supervisor was removed from the registry (stop, reconcile, or fatal error).
    ///
    /// Sets: `source`, `instance`, optional `reason`.
    StreamRemoved,

    /// A supervisor changed state.
    ///
    /// Sets: `source`, `instance`, `from`, `to`, optional `reason`.
    StateChanged,

    // === Process events ===
    /// A decoder process was spawned and its output opened.
    ///
    /// Sets: `source`, `instance`, `pid`.
    ProcessStarted,

    /// Spawning a decoder process failed.
    ///
    /// Sets: `source`, `instance`, `attempt`, `reason`.
    SpawnFailed,

    /// The decoder's output closed after a long enough run.
    ///
    /// Sets: `source`, `instance`, `pid`, `bytes`, optional `reason`.
    ProcessExited,

    /// The decoder's output closed within the fast-exit threshold.
    ///
    /// Sets: `source`, `instance`, `pid`, `reason` (captured diagnostics).
    FastExit,

    /// Stderr of the decoder matched a known failure.
    ///
    /// Sets: `source`, `instance`, `pid`, `reason` (failure label), `attempt`
    /// (consecutive permanent failures so far, `0` for transient ones).
    DecoderError,

    /// No data arrived within the silence timeout.
    ///
    /// Sets: `source`, `instance`, `delay_ms` (time since last data).
    WatchdogTimeout,

    /// A restart was requested.
    ///
    /// Sets: `source`, `instance`, `reason` (`manual` or `automatic`).
    RestartRequested,

    /// Restart requests collapsed into an already pending one.
    ///
    /// Sets: `source`, `instance`, `attempt` (number of drained signals).
    RestartCoalesced,

    /// A restart or spawn retry is delayed.
    ///
    /// Sets: `source`, `instance`, `attempt`, `delay_ms`.
    BackoffScheduled,

    /// Repeated failures opened the circuit breaker; restarts pause for the cooldown.
    ///
    /// Sets: `source`, `instance`, `attempt` (consecutive failures), `delay_ms`
    /// (remaining cooldown), `reason`.
    CircuitOpened,

    /// Cleanup of a decoder process finished.
    ///
    /// Sets: `source`, `instance`, `pid`, `delay_ms` (cleanup duration).
    CleanupCompleted,

    /// A decoder did not exit within the cleanup timeout and was force-killed.
    ///
    /// Sets: `source`, `instance`, `pid`, `reason`.
    CleanupTimeout,

    /// Audio events were dropped because the output channel was full.
    ///
    /// Sets: `source`, `instance`, `dropped` (total so far).
    OutputDropped,

    /// The supervisor stopped permanently because of a fatal condition.
    ///
    /// Sets: `source`, `instance`, `reason`.
    StreamFatal,

    // === Shutdown events ===
    /// Manager shutdown started.
    ShutdownRequested,

    /// All supervisors stopped within the grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some supervisors did not stop in time.
    ///
    /// Sets: `reason` (stuck sources).
    GraceExceeded,
}

/// Supervision event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Source identity, credentials stripped.
    pub source: Option<Arc<str>>,
    /// Supervisor instance id.
    pub instance: Option<u64>,
    /// Decoder process id.
    pub pid: Option<u32>,
    /// Human-readable reason (errors, diagnostics, transport).
    pub reason: Option<Arc<str>>,
    /// Restart or retry counter.
    pub attempt: Option<u32>,
    /// Delay or elapsed time in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Bytes read from the decoder.
    pub bytes: Option<u64>,
    /// Dropped output events.
    pub dropped: Option<u64>,
    /// Previous state (only for `StateChanged`).
    pub from: Option<ProcessState>,
    /// New state (only for `StateChanged`).
    pub to: Option<ProcessState>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            source: None,
            instance: None,
            pid: None,
            reason: None,
            attempt: None,
            delay_ms: None,
            bytes: None,
            dropped: None,
            from: None,
            to: None,
        }
    }

    #[inline]
    pub fn with_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[inline]
    pub fn with_instance(mut self, id: u64) -> Self {
        self.instance = Some(id);
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds, saturating).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    #[inline]
    pub fn with_bytes(mut self, n: u64) -> Self {
        self.bytes = Some(n);
        self
    }

    #[inline]
    pub fn with_dropped(mut self, n: u64) -> Self {
        self.dropped = Some(n);
        self
    }

    /// Attaches a state transition.
    #[inline]
    pub fn with_transition(mut self, from: ProcessState, to: ProcessState) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}
