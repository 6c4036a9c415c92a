//! Decoder processes: command construction, spawn, diagnostics and teardown.
//!
//! ## Contents
//! - [`DecoderCommand`], [`FfmpegCommand`] build the command for a source
//! - [`DecoderProcess`] one spawned decoder with its reaper and idempotent cleanup
//! - [`BoundedBuffer`] fixed-capacity stderr capture
//! - [`classify`] maps captured stderr to a [`DecoderFailure`]
//! - [`kill_process_group`], [`GroupSignal`] platform process-group primitive
//!
//! A `DecoderProcess` never outlives one attempt: the supervisor spawns it at the
//! start of an attempt and cleans it up before the next one begins.

mod command;
mod diagnostics;
mod failure;
mod group;
mod handle;

pub use command::{DecoderCommand, FfmpegCommand};
pub use diagnostics::{BoundedBuffer, DIAGNOSTICS_CAPACITY};
pub use failure::{classify, DecoderFailure, FailureKind};
pub use group::{configure_process_group, kill_process_group, GroupSignal};
pub use handle::{CleanupLimits, CleanupReport, DecoderProcess, ProcessExit};
