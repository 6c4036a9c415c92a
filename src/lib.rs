//! # streamvisor
//!
//! **Streamvisor** keeps one external audio decoder process (ffmpeg) running per
//! network source and recovers it when it stalls, crashes or exits.
//!
//! Every decoder is owned by exactly one supervisor. The supervisor restarts it with
//! exponential backoff, detects silent decoders with a watchdog, coalesces bursts of
//! restart requests into one, and tears processes down without leaving zombies or
//! orphaned grandchildren behind.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   reconcile(&[SourceConfig]) / start / stop / restart / health_check
//!                                   │
//!                                   ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  SupervisorManager                                                │
//! │  - registry: source id ─► StreamSupervisor + run task             │
//! │  - DesiredSources (shared set of ids that should be running)      │
//! │  - health monitor (periodic sweep, restarts silent streams)       │
//! │  - Bus (broadcast events)                                         │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │ Stream       │   │ Stream       │   │ Stream       │
//!   │ Supervisor   │   │ Supervisor   │   │ Supervisor   │
//!   │ (state loop) │   │ (state loop) │   │ (state loop) │
//!   └┬─────────────┘   └┬─────────────┘   └┬─────────────┘
//!    │ owns             │                  │
//!    ▼                  ▼                  ▼
//!   DecoderProcess     DecoderProcess     DecoderProcess
//!   - stdout ─► AudioSink ─► AudioEvent ─► bounded output channel
//!   - stderr ─► BoundedBuffer (4 KiB diagnostics)
//!   - reaper task (sole owner of the child, no zombies)
//!   - process group (SIGTERM / SIGKILL the whole tree)
//! ```
//!
//! ### Lifecycle
//! ```text
//! Idle ──► Starting ──► Running ──► (read loop)
//!                │                     │
//!                │ spawn error         ├─ restart signal   ─► cleanup, respawn now
//!                ▼                     ├─ watchdog timeout ─► cleanup, backoff(count)
//!            backoff(attempt)          ├─ exit < fast_exit ─► diagnostics, classify, backoff(count)
//!                                      ├─ stderr match     ─► cleanup, classify, backoff(count)
//!                                      ├─ exit / EOF       ─► backoff(count)
//!                                      └─ stop / removed   ─► Stopping ─► cleanup ─► Idle
//! ```
//!
//! ## Features
//! | Area              | Description                                                 | Key types / traits                          |
//! |-------------------|-------------------------------------------------------------|---------------------------------------------|
//! | **Management**    | Registry, reconcile, health monitor, graceful shutdown.     | [`SupervisorManager`], [`ManagerBuilder`]   |
//! | **Supervision**   | Per-source state machine with restart and watchdog.         | [`StreamSupervisor`], [`ProcessState`]      |
//! | **Processes**     | Spawn, diagnostics capture, idempotent group cleanup.       | [`DecoderProcess`], [`DecoderCommand`]      |
//! | **Diagnostics**   | Classifies decoder stderr into known failures.              | [`classify`], [`DecoderFailure`]            |
//! | **Policies**      | Exponential backoff, jitter, restart counting, circuit.     | [`BackoffPolicy`], [`CircuitBreakerPolicy`] |
//! | **Events**        | Broadcast supervision events.                               | [`Event`], [`EventKind`]                    |
//! | **Errors**        | Typed errors for streams, the manager and sinks.            | [`StreamError`], [`ManagerError`]           |
//! | **Configuration** | Per-stream and manager settings.                            | [`StreamConfig`], [`ManagerConfig`]         |
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use streamvisor::{ManagerConfig, SourceConfig, SupervisorManager, Transport};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = ManagerConfig::default();
//!     cfg.grace = Duration::from_secs(5);
//!
//!     let manager = SupervisorManager::builder(cfg).build();
//!     let (tx, mut rx) = mpsc::channel(256);
//!
//!     manager
//!         .reconcile(&[SourceConfig::new("rtsp://10.0.0.5/live", Transport::Tcp)], &tx)
//!         .await;
//!
//!     tokio::spawn(async move {
//!         while let Some(ev) = rx.recv().await {
//!             println!("{} level={}", ev.source, ev.level.level);
//!         }
//!     });
//!
//!     manager.run_until_signal().await?;
//!     Ok(())
//! }
//! ```
mod audio;
mod core;
mod error;
mod events;
mod policies;
mod process;
mod source;

// ---- Public re-exports ----

pub use audio::{AudioEvent, AudioLevel, AudioSink, NullSink, OctaveBand, SoundLevel};
pub use core::{
    watch, DataRate, HealthSnapshot, ManagerBuilder, ManagerConfig, ProcessState, ReconcileReport,
    RestartSignal, StateTransition, StreamConfig, StreamSupervisor, SupervisorDeps,
    SupervisorManager, Watchdog, WatchdogOutcome, RECENT_TRANSITIONS,
};
pub use error::{ManagerError, SinkError, StreamError};
pub use events::{Bus, Event, EventKind};
pub use policies::{
    Backoff, BackoffPolicy, CircuitBreaker, CircuitBreakerPolicy, JitterPolicy, RestartTracker,
};
pub use process::{
    classify, configure_process_group, kill_process_group, BoundedBuffer, CleanupLimits,
    CleanupReport, DecoderCommand, DecoderFailure, DecoderProcess, FailureKind, FfmpegCommand,
    GroupSignal, ProcessExit, DIAGNOSTICS_CAPACITY,
};
pub use source::{sanitize_url, DesiredSources, SourceConfig, SourceDescriptor, Transport};
