//! Supervision events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `StreamSupervisor` (state, process, restart events),
//!   `DecoderProcess` cleanup, `SupervisorManager` (registry and shutdown events).
//! - **Consumers**: anything holding `SupervisorManager::subscribe()`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
