//! # One running decoder process.
//!
//! [`DecoderProcess`] wraps a spawned decoder and guarantees it is torn down
//! exactly once, without leaving a zombie behind.
//!
//! ## Architecture
//! ```text
//!            spawn()
//!               │
//!               ├──► reaper task ── owns Child, only caller of wait()
//!               │        ▲  │        publishes exit on a watch channel
//!    kill_tx ───┼────────┘  │        token cancelled → group SIGTERM
//!               │           ▼
//!               │      exit_rx (observed by cleanup, health, tests)
//!               │
//!               └──► stderr pump ── BoundedBuffer (last 4 KiB)
//! ```
//!
//! ## Cleanup sequence
//! 1. close the output stream (read loop sees `output_closed`)
//! 2. cancel the process token (reaper sends a graceful group terminate)
//! 3. wait for exit, bounded by `cleanup_timeout`
//! 4. on timeout, force-kill the process group; if that fails, kill the process directly
//! 5. wait for the reaper to confirm the exit, bounded by `reap_timeout`
//! 6. release per-process state (diagnostics, stderr pump)
//!
//! Concurrent callers serialize on an async mutex; the first to complete the
//! sequence gets a [`CleanupReport`], the rest get `None`. A cleanup whose
//! future was dropped before completing leaves the flag unset.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::process::diagnostics::BoundedBuffer;
use crate::process::group::{configure_process_group, kill_process_group, GroupSignal};

/// How a decoder process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if terminated by a signal or the wait failed.
    pub code: Option<i32>,
    pub success: bool,
}

/// Timeouts governing [`DecoderProcess::cleanup`].
#[derive(Clone, Copy, Debug)]
pub struct CleanupLimits {
    /// Wait for a graceful exit before force-killing.
    pub cleanup_timeout: Duration,
    /// Wait for the reaper after the forced kill.
    pub reap_timeout: Duration,
}

/// Result of the one cleanup that actually ran.
#[derive(Clone, Debug)]
pub struct CleanupReport {
    pub pid: u32,
    /// The process ignored the graceful request and was force-killed.
    pub timed_out: bool,
    /// The reaper confirmed the exit within the bounded wait.
    pub reaped: bool,
    pub exit: Option<ProcessExit>,
    /// Captured stderr at release time.
    pub diagnostics: String,
    pub elapsed: Duration,
}

/// Handle to one spawned decoder.
#[derive(Debug)]
pub struct DecoderProcess {
    pid: u32,
    label: Arc<str>,
    started_at: Instant,
    limits: CleanupLimits,

    stdout: Mutex<Option<ChildStdout>>,
    diagnostics: Arc<BoundedBuffer>,
    stderr_pump: Mutex<Option<JoinHandle<()>>>,

    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: mpsc::UnboundedSender<()>,

    token: CancellationToken,
    output_closed: CancellationToken,
    cleaned: tokio::sync::Mutex<bool>,
}

impl DecoderProcess {
    /// Spawns `cmd` in its own process group with piped stdout/stderr.
    ///
    /// `label` is the sanitized source name used in logs. The process token is a
    /// child of `parent`, so cancelling `parent` starts a graceful shutdown too.
    pub fn spawn(
        mut cmd: Command,
        label: Arc<str>,
        limits: CleanupLimits,
        parent: &CancellationToken,
    ) -> Result<Self, StreamError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StreamError::Config {
                    reason: format!(
                        "decoder not found: {}",
                        cmd.as_std().get_program().to_string_lossy()
                    ),
                }
            } else {
                StreamError::Spawn { source }
            }
        })?;
        let pid = child.id().ok_or_else(|| StreamError::Spawn {
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before pid was read",
            ),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(StreamError::MissingPipe { pipe: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(StreamError::MissingPipe { pipe: "stderr" })?;

        let token = parent.child_token();
        let diagnostics = Arc::new(BoundedBuffer::default());
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(reap(child, pid, label.clone(), token.clone(), kill_rx, exit_tx));
        let stderr_pump = tokio::spawn(pump_stderr(stderr, diagnostics.clone()));

        debug!(source = %label, pid, "decoder spawned");
        Ok(Self {
            pid,
            label,
            started_at: Instant::now(),
            limits,
            stdout: Mutex::new(Some(stdout)),
            diagnostics,
            stderr_pump: Mutex::new(Some(stderr_pump)),
            exit_rx,
            kill_tx,
            token,
            output_closed: CancellationToken::new(),
            cleaned: tokio::sync::Mutex::new(false),
        })
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Takes the output stream. Only the first call gets it.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Cancelled when cleanup closes the output; the read loop selects on it.
    pub fn output_closed(&self) -> &CancellationToken {
        &self.output_closed
    }

    /// Current diagnostic output.
    pub fn diagnostics(&self) -> String {
        self.diagnostics.read()
    }

    /// Exit information, once the reaper observed it.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Waits up to `limit` for the reaper to report the exit.
    pub async fn wait_exit(&self, limit: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        // Err from wait_for means the reaper is gone; nothing left to wait for.
        let exited = tokio::time::timeout(limit, rx.wait_for(|s| s.is_some()))
            .await
            .is_ok();
        exited
    }

    /// Tears the process down. Idempotent; see the module docs for the sequence.
    ///
    /// The process only counts as cleaned up once the sequence completes. If the
    /// returned future is dropped halfway, the next call runs it again.
    pub async fn cleanup(&self) -> Option<CleanupReport> {
        let mut cleaned = self.cleaned.lock().await;
        if *cleaned {
            return None;
        }
        let began = Instant::now();

        self.output_closed.cancel();
        drop(self.take_stdout());

        self.token.cancel();

        let mut timed_out = false;
        if !self.wait_exit(self.limits.cleanup_timeout).await {
            timed_out = true;
            warn!(
                source = %self.label,
                pid = self.pid,
                timeout_ms = self.limits.cleanup_timeout.as_millis() as u64,
                "decoder ignored termination, killing process group"
            );
            if let Err(e) = kill_process_group(self.pid, GroupSignal::Kill).await {
                debug!(source = %self.label, pid = self.pid, error = %e, "group kill failed, killing process");
                let _ = self.kill_tx.send(());
            }
        }

        let mut reaped = self.wait_exit(self.limits.reap_timeout).await;
        if !reaped {
            let _ = self.kill_tx.send(());
            reaped = self.wait_exit(self.limits.reap_timeout).await;
            if !reaped {
                warn!(
                    source = %self.label,
                    pid = self.pid,
                    "decoder not reaped within bound, leaving it to the runtime"
                );
            }
        }

        let pump = self.stderr_pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(self.limits.reap_timeout, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        let diagnostics = self.diagnostics.read();
        self.diagnostics.clear();

        let report = CleanupReport {
            pid: self.pid,
            timed_out,
            reaped,
            exit: self.exit_status(),
            diagnostics,
            elapsed: began.elapsed(),
        };
        debug!(
            source = %self.label,
            pid = self.pid,
            timed_out,
            reaped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "decoder cleaned up"
        );
        *cleaned = true;
        Some(report)
    }
}

/// Sole owner of the `Child`. Every other path observes the exit via `exit_tx`.
async fn reap(
    mut child: Child,
    pid: u32,
    label: Arc<str>,
    token: CancellationToken,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let mut terminate_sent = false;
    let waited = loop {
        tokio::select! {
            res = child.wait() => break res,
            _ = token.cancelled(), if !terminate_sent => {
                terminate_sent = true;
                if let Err(e) = kill_process_group(pid, GroupSignal::Terminate).await {
                    debug!(source = %label, pid, error = %e, "group terminate failed");
                    let _ = child.start_kill();
                }
            }
            Some(()) = kill_rx.recv() => {
                let _ = child.start_kill();
            }
        }
    };

    let exit = match waited {
        Ok(status) => ProcessExit {
            code: status.code(),
            success: status.success(),
        },
        Err(e) => {
            warn!(source = %label, pid, error = %e, "waiting for decoder failed");
            ProcessExit {
                code: None,
                success: false,
            }
        }
    };
    debug!(source = %label, pid, code = ?exit.code, "decoder exited");
    exit_tx.send_replace(Some(exit));
}

async fn pump_stderr(mut stderr: ChildStderr, sink: Arc<BoundedBuffer>) {
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink.write(&buf[..n]);
            }
        }
    }
}
