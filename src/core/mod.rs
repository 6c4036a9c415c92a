//! Runtime core: per-source supervision and the manager that owns it.
//!
//! The public API from this module is [`SupervisorManager`] (with its
//! [`ManagerBuilder`]) and the single-source [`StreamSupervisor`].
//!
//! Internal modules:
//! - [`supervisor`]: state machine for one source (spawn, read, restart, backoff);
//! - [`runner`]: one read attempt against a running decoder;
//! - [`watchdog`]: silence detection for a running decoder;
//! - [`signal`]: coalescing restart signal;
//! - [`health`]: process states, transition history and health snapshots;
//! - [`rate`]: sliding-window byte rate;
//! - [`manager`]: registry, reconcile, health monitor and shutdown;
//! - [`shutdown`]: termination signal handling.

mod builder;
mod config;
mod health;
mod manager;
mod rate;
mod runner;
mod shutdown;
mod signal;
mod supervisor;
mod watchdog;

pub use builder::ManagerBuilder;
pub use config::{ManagerConfig, StreamConfig};
pub use health::{HealthSnapshot, ProcessState, StateTransition, RECENT_TRANSITIONS};
pub use manager::{ReconcileReport, SupervisorManager};
pub use rate::DataRate;
pub use signal::RestartSignal;
pub use supervisor::{StreamSupervisor, SupervisorDeps};
pub use watchdog::{watch, Watchdog, WatchdogOutcome};
