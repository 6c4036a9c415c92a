//! # Read loop for one decoder attempt.
//!
//! [`read_loop`] drives a single spawned [`DecoderProcess`] until something ends
//! the attempt, and reports why as a [`ReadExit`]. The supervisor decides what
//! to do with it (restart, back off, stop).
//!
//! ## Flow
//! ```text
//! spawn watchdog task (attempt token)
//! loop select (biased):
//!   ├─ supervisor token cancelled ──► Cancelled
//!   ├─ output closed by cleanup ────► OutputClosed
//!   ├─ restart signal ──────────────► RestartRequested
//!   ├─ watchdog JoinHandle ready ───► WatchdogTimeout | NoLongerDesired
//!   ├─ early stderr scan tick ──────► DecoderFailed (known failure in stderr)
//!   └─ read(stdout):
//!        ├─ Ok(0)  ──► Eof { ran_for }   (FastExit below fast_exit_threshold)
//!        ├─ Err(e) ──► ReadError(e)      (FastExit below fast_exit_threshold)
//!        └─ Ok(n)  ──► watchdog.update, process_chunk:
//!                        ├─ Continue
//!                        ├─ Restart ──► RestartRequested
//!                        └─ Fatal   ──► Fatal(err)
//! ```
//!
//! ## Rules
//! - The watchdog runs as its own task and is cancelled when the attempt ends.
//!   It never restarts anything itself: its outcome comes back through the
//!   `JoinHandle` branch of the same select, so a watchdog timeout and a restart
//!   signal can never both act on one attempt. Whichever branch wins ends the
//!   loop, and the supervisor runs exactly one cleanup for it.
//! - A collaborator error never ends the loop unless it is fatal.
//! - Stderr is only scanned while the decoder is younger than the early error
//!   window; after that, failures surface as exits or watchdog timeouts.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::supervisor::StreamSupervisor;
use crate::core::watchdog::{watch, WatchdogOutcome};
use crate::error::StreamError;
use crate::process::{classify, DecoderFailure, DecoderProcess};

/// Result of handling one chunk of decoder output.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Keep reading.
    Continue,
    /// A restart is pending; end the attempt.
    Restart,
    /// The stream can never produce useful data again.
    Fatal(StreamError),
}

/// Why one read loop ended.
#[derive(Debug)]
pub(crate) enum ReadExit {
    /// The supervisor is stopping.
    Cancelled,
    /// Cleanup closed the output from outside the loop.
    OutputClosed,
    RestartRequested,
    WatchdogTimeout(Duration),
    NoLongerDesired,
    /// The decoder closed its output.
    Eof { ran_for: Duration },
    ReadError(io::Error),
    /// Output ended, cleanly or with a read error, before the fast-exit threshold.
    FastExit {
        ran_for: Duration,
        error: Option<io::Error>,
    },
    /// Stderr matched a known failure early in the attempt.
    DecoderFailed(DecoderFailure),
    Fatal(StreamError),
}

pub(crate) async fn read_loop(sup: &Arc<StreamSupervisor>, process: &DecoderProcess) -> ReadExit {
    let Some(mut stdout) = process.take_stdout() else {
        return ReadExit::OutputClosed;
    };

    let attempt = sup.token().child_token();
    let _attempt_guard = attempt.clone().drop_guard();
    let mut watchdog = {
        let sup = Arc::clone(sup);
        let tick = sup.config().watchdog_tick_clamped();
        let silence = sup.config().silence_timeout;
        tokio::spawn(async move {
            watch(
                sup.watchdog(),
                sup.source().id(),
                sup.desired(),
                tick,
                silence,
                &attempt,
            )
            .await
        })
    };

    let early = sup.config().early_error_check();
    let (early_window, poll) = early.unwrap_or((Duration::ZERO, Duration::from_secs(1)));
    let mut scanning = early.is_some();
    let mut early_tick = tokio::time::interval_at(Instant::now() + poll, poll);
    early_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let fast_exit = sup.config().fast_exit_threshold;
    let mut buf = vec![0u8; sup.config().read_buffer_size_clamped()];
    loop {
        tokio::select! {
            biased;
            _ = sup.token().cancelled() => return ReadExit::Cancelled,
            _ = process.output_closed().cancelled() => return ReadExit::OutputClosed,
            _ = sup.restart_signal().recv() => return ReadExit::RestartRequested,
            outcome = &mut watchdog => {
                return match outcome {
                    Ok(WatchdogOutcome::TimedOut(since)) => ReadExit::WatchdogTimeout(since),
                    Ok(WatchdogOutcome::NoLongerDesired) => ReadExit::NoLongerDesired,
                    Ok(WatchdogOutcome::Cancelled) | Err(_) => ReadExit::Cancelled,
                };
            }
            _ = early_tick.tick(), if scanning => {
                if let Some(failure) = classify(&process.diagnostics()) {
                    return ReadExit::DecoderFailed(failure);
                }
                if process.uptime() >= early_window {
                    scanning = false;
                }
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => return output_ended(process.uptime(), fast_exit, None),
                Ok(n) => {
                    sup.watchdog().update();
                    match sup.process_chunk(&buf[..n]) {
                        ChunkOutcome::Continue => {}
                        ChunkOutcome::Restart => return ReadExit::RestartRequested,
                        ChunkOutcome::Fatal(err) => return ReadExit::Fatal(err),
                    }
                }
                Err(e) => return output_ended(process.uptime(), fast_exit, Some(e)),
            }
        }
    }
}

/// Classifies the end of the decoder's output by how long the decoder ran.
fn output_ended(ran_for: Duration, fast_exit: Duration, error: Option<io::Error>) -> ReadExit {
    if ran_for < fast_exit {
        return ReadExit::FastExit { ran_for, error };
    }
    match error {
        Some(e) => ReadExit::ReadError(e),
        None => ReadExit::Eof { ran_for },
    }
}
