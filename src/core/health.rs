//! # Supervisor states and health snapshots.
//!
//! ```text
//!   Idle ──► Starting ──► Running ──┬──► Restarting ──┐
//!    ▲          │                   └──► Stopping ────┤
//!    │          └── spawn failed (backoff) ──────────►│
//!    └────────────────────────────────────────────────┘
//! ```
//!
//! `Idle` is both the initial state and the terminal state after `stop()`.
//! [`HealthSnapshot`] is a value computed on demand; it never aliases live state.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::source::Transport;

/// Number of transitions included in a [`HealthSnapshot`].
pub const RECENT_TRANSITIONS: usize = 10;

/// Lifecycle state of a stream supervisor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProcessState {
    #[default]
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Idle => "idle",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Restarting => "restarting",
            ProcessState::Stopping => "stopping",
        }
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (_, Idle)
                | (Idle, Starting)
                | (Starting, Running)
                | (Running, Restarting)
                | (Running, Stopping)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ProcessState,
    pub to: ProcessState,
    pub at: SystemTime,
    pub reason: String,
}

/// Current state plus a bounded history of transitions.
#[derive(Debug)]
pub(crate) struct StateHistory {
    current: ProcessState,
    entries: VecDeque<StateTransition>,
    capacity: usize,
}

impl StateHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            current: ProcessState::Idle,
            entries: VecDeque::with_capacity(capacity.min(RECENT_TRANSITIONS * 2)),
            capacity: capacity.max(1),
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> ProcessState {
        self.current
    }

    /// Applies a transition. Same-state transitions are ignored and return `None`.
    pub(crate) fn transition(&mut self, to: ProcessState, reason: &str) -> Option<StateTransition> {
        if self.current == to {
            return None;
        }
        let entry = StateTransition {
            from: self.current,
            to,
            at: SystemTime::now(),
            reason: reason.to_string(),
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        self.current = to;
        Some(entry)
    }

    /// The last `n` transitions, oldest first.
    pub(crate) fn recent(&self, n: usize) -> Vec<StateTransition> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// Point-in-time health of one stream.
#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    /// Source identity, credentials stripped.
    pub source: String,
    pub transport: Transport,
    /// Supervisor instance id; changes when the stream is recreated.
    pub instance: u64,
    pub state: ProcessState,
    /// Current process delivered data within the healthy threshold.
    pub is_healthy: bool,
    /// Current process delivered data within the receiving threshold.
    pub is_receiving_data: bool,
    /// Age of the last chunk from the current process; `None` before its first chunk.
    pub last_data_age: Option<Duration>,
    pub total_bytes: u64,
    /// Bytes per second of the current process over the last 10s.
    pub bytes_per_sec: f64,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub process_uptime: Option<Duration>,
    pub dropped_events: u64,
    pub last_error: Option<String>,
    /// Circuit breaker cooldown in progress.
    pub circuit_open: bool,
    /// Most recent transitions, oldest first.
    pub recent_transitions: Vec<StateTransition>,
}
