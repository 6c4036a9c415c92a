//! # StreamSupervisor: owns one source's decoder lifecycle.
//!
//! A [`StreamSupervisor`] spawns the decoder for one source, runs the read loop,
//! restarts the decoder when it stalls or dies, and tears it down without leaving
//! zombies behind.
//!
//! ## State machine
//! ```text
//! run()
//! loop {
//!   ├─► exit if stopped / cancelled / no longer desired
//!   ├─► Idle → Starting
//!   ├─► spawn decoder
//!   │     ├─ config error ──► StreamFatal, return Err (no retry)
//!   │     └─ spawn error  ──► Starting → Idle, backoff wait (spawn counter), retry
//!   ├─► Starting → Running, read_loop()
//!   │     ├─ RestartRequested ──► Restarting, cleanup, no wait
//!   │     ├─ WatchdogTimeout  ──► Restarting, cleanup, record restart, backoff wait
//!   │     ├─ Eof              ──► Restarting, cleanup, record restart, backoff wait
//!   │     ├─ FastExit         ──► Stopping (Eof or ReadError < 5s, with diagnostics),
//!   │     │                       cleanup, classify, same backoff
//!   │     ├─ ReadError        ──► Restarting, cleanup, record restart, backoff wait
//!   │     ├─ DecoderFailed    ──► Restarting, cleanup, classify, backoff wait
//!   │     │                       (too many permanent failures in a row: StreamFatal, return Err)
//!   │     ├─ NoLongerDesired  ──► Stopping, cleanup, return Ok
//!   │     ├─ Fatal            ──► Stopping, cleanup, StreamFatal, return Err
//!   │     └─ Cancelled        ──► Stopping, cleanup, return Ok
//!   └─► → Idle
//! }
//! ```
//!
//! ## Rules
//! - At most one decoder process per supervisor; the next is spawned only after the
//!   previous one was cleaned up and its handle cleared.
//! - `stop()` is terminal: a stopped supervisor never spawns again.
//! - Restart count, last-data timestamp and state history each sit behind their own lock.
//! - Backoff waits are interruptible by cancellation and by a restart signal.
//! - Health reflects the current process only: its last chunk, its byte rate.
//!   A freshly spawned decoder has no data age until its first chunk.
//! - Fast exits and early stderr matches are classified. Permanent ones (bad
//!   credentials, missing stream) count towards `permanent_failure_limit`; any
//!   attempt that delivered data clears the count.
//! - With a circuit breaker configured, a process failure may open it; the next
//!   wait is then the remaining cooldown instead of the backoff delay.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioEvent, AudioSink};
use crate::core::config::StreamConfig;
use crate::core::health::{HealthSnapshot, ProcessState, StateHistory, RECENT_TRANSITIONS};
use crate::core::rate::DataRate;
use crate::core::runner::{read_loop, ChunkOutcome, ReadExit};
use crate::core::signal::RestartSignal;
use crate::core::watchdog::Watchdog;
use crate::error::{SinkError, StreamError};
use crate::events::{Bus, Event, EventKind};
use crate::policies::{Backoff, CircuitBreaker, RestartTracker};
use crate::process::{classify, CleanupReport, DecoderCommand, DecoderFailure, DecoderProcess};
use crate::source::{DesiredSources, SourceDescriptor};

/// Source of supervisor instance ids.
static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Collaborators a supervisor needs besides its source and config.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub decoder: Arc<dyn DecoderCommand>,
    pub sink: Arc<dyn AudioSink>,
    pub desired: DesiredSources,
    pub bus: Bus,
}

/// How a backoff wait ended.
enum Wait {
    Elapsed,
    Restart,
    Cancelled,
}

/// Warn at most once per interval.
#[derive(Debug)]
struct RateLimit {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimit {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Supervises the decoder process of one source.
pub struct StreamSupervisor {
    instance: u64,
    source: SourceDescriptor,
    /// Sanitized source for logs and events.
    label: Arc<str>,
    cfg: StreamConfig,
    decoder: Arc<dyn DecoderCommand>,
    sink: Arc<dyn AudioSink>,
    output: mpsc::Sender<AudioEvent>,
    desired: DesiredSources,
    bus: Bus,

    /// Lifetime token; cancelled by `stop()`.
    token: CancellationToken,
    stopped: AtomicBool,
    finished: AtomicBool,
    restart: RestartSignal,
    /// Set by a manual restart request; consumed when the restart happens.
    manual_restart: AtomicBool,

    current: Mutex<Option<Arc<DecoderProcess>>>,
    restarts: Mutex<RestartTracker>,
    watchdog: Watchdog,
    history: Mutex<StateHistory>,
    last_error: Mutex<Option<String>>,
    circuit: Option<Mutex<CircuitBreaker>>,

    /// Last chunk of the current process; reset on every spawn.
    last_data: Mutex<Option<Instant>>,
    rate: Mutex<DataRate>,
    process_bytes: AtomicU64,
    total_bytes: AtomicU64,
    dropped: AtomicU64,
    drop_log: RateLimit,
    processor_log: RateLimit,
}

impl StreamSupervisor {
    /// Creates a supervisor. Nothing runs until [`StreamSupervisor::run`] is awaited.
    pub fn new(
        source: SourceDescriptor,
        cfg: StreamConfig,
        deps: SupervisorDeps,
        output: mpsc::Sender<AudioEvent>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let label: Arc<str> = source.safe_display().into();
        Arc::new(Self {
            instance: INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed),
            label,
            restarts: Mutex::new(RestartTracker::new(cfg.restart_reset_window)),
            history: Mutex::new(StateHistory::new(cfg.history_capacity)),
            circuit: cfg.circuit_breaker.map(|p| Mutex::new(CircuitBreaker::new(p))),
            drop_log: RateLimit::new(cfg.drop_log_interval),
            processor_log: RateLimit::new(cfg.drop_log_interval),
            source,
            cfg,
            decoder: deps.decoder,
            sink: deps.sink,
            output,
            desired: deps.desired,
            bus: deps.bus,
            token: parent.child_token(),
            stopped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            restart: RestartSignal::new(),
            manual_restart: AtomicBool::new(false),
            current: Mutex::new(None),
            watchdog: Watchdog::new(),
            last_error: Mutex::new(None),
            last_data: Mutex::new(None),
            rate: Mutex::new(DataRate::new()),
            process_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Unique id of this supervisor instance.
    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    #[inline]
    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    #[inline]
    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn state(&self) -> ProcessState {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).current()
    }

    /// Whether a restart is pending or in progress.
    pub fn is_restarting(&self) -> bool {
        self.restart.is_pending() || self.state() == ProcessState::Restarting
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether [`StreamSupervisor::run`] has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Pid of the running decoder, if any.
    pub fn pid(&self) -> Option<u32> {
        self.current_process().map(|p| p.pid())
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.lock().unwrap_or_else(|e| e.into_inner()).count()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub(crate) fn desired(&self) -> &DesiredSources {
        &self.desired
    }

    pub(crate) fn restart_signal(&self) -> &RestartSignal {
        &self.restart
    }

    /// Runs the supervision loop until stopped, removed from the desired set,
    /// or a fatal error occurs.
    pub async fn run(self: Arc<Self>) -> Result<(), StreamError> {
        let res = self.run_loop().await;
        if let Some(process) = self.current_process() {
            self.finish_cleanup(&process).await;
        }
        self.transition(ProcessState::Idle, "supervisor exited");
        self.finished.store(true, Ordering::Release);
        res
    }

    async fn run_loop(self: &Arc<Self>) -> Result<(), StreamError> {
        let mut spawn_backoff = Backoff::new(self.cfg.backoff);
        let mut permanent_failures: u32 = 0;

        loop {
            if self.should_exit() {
                return Ok(());
            }
            self.transition(ProcessState::Starting, "starting decoder");

            let process = match self.spawn_process() {
                Ok(process) => process,
                Err(err) if err.is_fatal() => {
                    self.transition(ProcessState::Idle, "configuration error");
                    return Err(self.fatal(err));
                }
                Err(err) => {
                    self.set_last_error(&err);
                    self.transition(ProcessState::Idle, "spawn failed");
                    let delay = spawn_backoff.next_delay();
                    warn!(
                        source = %self.label,
                        attempt = spawn_backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to start decoder"
                    );
                    self.bus.publish(
                        self.event(EventKind::SpawnFailed)
                            .with_attempt(spawn_backoff.attempt())
                            .with_reason(err.to_string()),
                    );
                    match self.wait_backoff(delay, spawn_backoff.attempt()).await {
                        Wait::Cancelled => return Ok(()),
                        Wait::Restart => spawn_backoff.reset(),
                        Wait::Elapsed => {}
                    }
                    continue;
                }
            };
            spawn_backoff.reset();

            let exit = read_loop(self, &process).await;
            match exit {
                ReadExit::RestartRequested => {
                    self.transition(ProcessState::Restarting, "restart requested");
                    self.finish_cleanup(&process).await;
                    self.apply_manual_reset();
                    info!(source = %self.label, "restarting decoder");
                }
                ReadExit::WatchdogTimeout(since) => {
                    self.transition(ProcessState::Restarting, "no data received");
                    warn!(
                        source = %self.label,
                        since_ms = since.as_millis() as u64,
                        "no data from decoder, restarting"
                    );
                    self.bus
                        .publish(self.event(EventKind::WatchdogTimeout).with_delay(since));
                    self.finish_cleanup(&process).await;
                    if self.restart_after_failure().await {
                        return Ok(());
                    }
                }
                ReadExit::Eof { .. }
                | ReadExit::FastExit { .. }
                | ReadExit::OutputClosed
                | ReadExit::Cancelled
                    if self.should_exit() =>
                {
                    self.transition(ProcessState::Stopping, "stopping");
                    self.finish_cleanup(&process).await;
                    return Ok(());
                }
                ReadExit::FastExit { ran_for, error } => {
                    let failure = self.fast_exit(&process, ran_for, error).await;
                    self.failed_attempt(&process, ran_for, failure, &mut permanent_failures)
                        .await?;
                    if self.restart_after_failure().await {
                        return Ok(());
                    }
                }
                ReadExit::Eof { ran_for } => {
                    self.transition(ProcessState::Restarting, "decoder exited");
                    self.finish_cleanup(&process).await;
                    info!(
                        source = %self.label,
                        pid = process.pid(),
                        ran_for_ms = ran_for.as_millis() as u64,
                        "decoder ended"
                    );
                    self.set_last_error(&StreamError::Exited { ran_for });
                    self.bus.publish(
                        self.event(EventKind::ProcessExited)
                            .with_pid(process.pid())
                            .with_bytes(self.total_bytes.load(Ordering::Relaxed)),
                    );
                    self.failed_attempt(&process, ran_for, None, &mut permanent_failures)
                        .await?;
                    if self.restart_after_failure().await {
                        return Ok(());
                    }
                }
                ReadExit::ReadError(source) => {
                    let ran_for = process.uptime();
                    let err = StreamError::Read { source };
                    self.transition(ProcessState::Restarting, "read failed");
                    warn!(source = %self.label, error = %err, "decoder output failed");
                    self.set_last_error(&err);
                    self.finish_cleanup(&process).await;
                    self.failed_attempt(&process, ran_for, None, &mut permanent_failures)
                        .await?;
                    if self.restart_after_failure().await {
                        return Ok(());
                    }
                }
                ReadExit::DecoderFailed(failure) => {
                    let ran_for = process.uptime();
                    self.transition(ProcessState::Restarting, "decoder reported an error");
                    self.finish_cleanup(&process).await;
                    self.failed_attempt(&process, ran_for, Some(failure), &mut permanent_failures)
                        .await?;
                    if self.restart_after_failure().await {
                        return Ok(());
                    }
                }
                ReadExit::OutputClosed => {
                    self.transition(ProcessState::Restarting, "output closed");
                    self.finish_cleanup(&process).await;
                }
                ReadExit::Cancelled => {
                    self.transition(ProcessState::Stopping, "cancelled");
                    self.finish_cleanup(&process).await;
                    return Ok(());
                }
                ReadExit::NoLongerDesired => {
                    self.transition(ProcessState::Stopping, "source no longer configured");
                    debug!(source = %self.label, "source removed from configuration");
                    self.finish_cleanup(&process).await;
                    return Ok(());
                }
                ReadExit::Fatal(err) => {
                    self.transition(ProcessState::Stopping, "fatal sink error");
                    self.finish_cleanup(&process).await;
                    self.transition(ProcessState::Idle, "fatal sink error");
                    return Err(self.fatal(err));
                }
            }
            self.transition(ProcessState::Idle, "decoder cleaned up");
        }
    }

    /// Stops the supervisor permanently and tears down the running decoder.
    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(source = %self.label, instance = self.instance, "stopping stream");
        }
        self.token.cancel();
        if let Some(process) = self.current_process() {
            self.finish_cleanup(&process).await;
        }
    }

    /// Requests a restart of the running decoder.
    ///
    /// A `manual` restart also forgets previous restarts, so the next failure
    /// starts again at the base backoff delay.
    pub fn restart(&self, manual: bool) {
        if self.is_stopped() {
            return;
        }
        if manual {
            self.manual_restart.store(true, Ordering::Release);
        }
        let kind = if manual { "manual" } else { "automatic" };
        self.bus
            .publish(self.event(EventKind::RestartRequested).with_reason(kind));
        if !self.restart.request() {
            debug!(source = %self.label, "restart already pending");
            let drained = self.restart.coalesced().min(u64::from(u32::MAX)) as u32;
            self.bus
                .publish(self.event(EventKind::RestartCoalesced).with_attempt(drained));
        }
    }

    /// Computes a health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        let last_data_age = self
            .last_data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed());
        let bytes_per_sec = self.rate.lock().unwrap_or_else(|e| e.into_inner()).rate();
        let circuit_open = self.circuit.as_ref().is_some_and(|cb| {
            cb.lock()
                .unwrap_or_else(|e| e.into_inner())
                .remaining()
                .is_some()
        });
        let (state, recent_transitions) = {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            (history.current(), history.recent(RECENT_TRANSITIONS))
        };
        let process = self.current_process();
        HealthSnapshot {
            source: self.label.to_string(),
            transport: self.source.transport(),
            instance: self.instance,
            state,
            is_healthy: last_data_age.is_some_and(|age| age < self.cfg.healthy_threshold),
            is_receiving_data: last_data_age.is_some_and(|age| age < self.cfg.receiving_threshold),
            last_data_age,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            bytes_per_sec,
            restart_count: self.restart_count(),
            pid: process.as_ref().map(|p| p.pid()),
            process_uptime: process.as_ref().map(|p| p.uptime()),
            dropped_events: self.dropped.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            circuit_open,
            recent_transitions,
        }
    }

    /// Dispatches one chunk to the collaborators and the output channel.
    pub(crate) fn process_chunk(&self, data: &[u8]) -> ChunkOutcome {
        let n = data.len() as u64;
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        self.process_bytes.fetch_add(n, Ordering::Relaxed);
        *self.last_data.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.rate.lock().unwrap_or_else(|e| e.into_inner()).record(n);
        if let Err(err) = self.handle_audio(data) {
            return ChunkOutcome::Fatal(err);
        }
        if self.restart.take() {
            return ChunkOutcome::Restart;
        }
        ChunkOutcome::Continue
    }

    fn handle_audio(&self, data: &[u8]) -> Result<(), StreamError> {
        let id = self.source.id();

        if let Err(err) = self.sink.write_analysis(id, data) {
            self.sink_failed("write_analysis", err)?;
        }
        if let Err(err) = self.sink.write_capture(id, data) {
            self.sink_failed("write_capture", err)?;
        }
        self.sink.broadcast(id, data);

        let mut event = AudioEvent {
            source: Arc::from(id),
            level: self.sink.audio_level(data, id),
            sound_level: None,
            timestamp: SystemTime::now(),
        };

        if self.sink.sound_level_enabled() {
            match self.sink.process_sound_level(id, data) {
                Ok(level) => event.sound_level = Some(level),
                Err(SinkError::IntervalIncomplete | SinkError::NoAudioData) => {}
                Err(SinkError::ProcessorNotRegistered) => {
                    if self.processor_log.ready() {
                        warn!(
                            source = %self.label,
                            "sound level processor not registered (further messages suppressed)"
                        );
                    }
                }
                Err(err) => self.sink_failed("process_sound_level", err)?,
            }
        }

        match self.output.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => self.record_drop(),
        }
        Ok(())
    }

    fn sink_failed(&self, operation: &'static str, err: SinkError) -> Result<(), StreamError> {
        if err.is_fatal() {
            return Err(StreamError::Sink { source: err });
        }
        warn!(source = %self.label, operation, error = %err, "audio sink error");
        Ok(())
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_log.ready() {
            warn!(source = %self.label, dropped, "audio event dropped, output channel full");
            self.bus
                .publish(self.event(EventKind::OutputDropped).with_dropped(dropped));
        }
    }

    fn spawn_process(&self) -> Result<Arc<DecoderProcess>, StreamError> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.as_ref() {
            // Never reached through run(): every exit path cleans up first.
            error!(source = %self.label, pid = previous.pid(), "previous decoder still set");
            return Err(StreamError::Spawn {
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "previous decoder still running",
                ),
            });
        }

        let cmd = self.decoder.command(&self.source)?;
        let process = Arc::new(DecoderProcess::spawn(
            cmd,
            self.label.clone(),
            self.cfg.cleanup_limits(),
            &self.token,
        )?);
        *current = Some(Arc::clone(&process));
        drop(current);

        self.watchdog.update();
        *self.last_data.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.rate.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.process_bytes.store(0, Ordering::Relaxed);
        self.transition(ProcessState::Running, "decoder started");
        info!(
            source = %self.label,
            pid = process.pid(),
            transport = %self.source.transport(),
            "decoder started"
        );
        self.bus
            .publish(self.event(EventKind::ProcessStarted).with_pid(process.pid()));
        Ok(process)
    }

    fn current_process(&self) -> Option<Arc<DecoderProcess>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Runs the idempotent cleanup and clears the handle if it still points at `process`.
    async fn finish_cleanup(&self, process: &Arc<DecoderProcess>) -> Option<CleanupReport> {
        let report = process.cleanup().await;
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|p| Arc::ptr_eq(p, process)) {
                *current = None;
            }
        }
        if let Some(report) = &report {
            if report.timed_out {
                self.bus.publish(
                    self.event(EventKind::CleanupTimeout)
                        .with_pid(report.pid)
                        .with_reason("decoder ignored termination and was killed"),
                );
            }
            self.bus.publish(
                self.event(EventKind::CleanupCompleted)
                    .with_pid(report.pid)
                    .with_delay(report.elapsed),
            );
        }
        report
    }

    /// Logs a decoder that ended within the fast-exit threshold and classifies
    /// what it wrote to stderr.
    async fn fast_exit(
        &self,
        process: &Arc<DecoderProcess>,
        ran_for: Duration,
        read_error: Option<io::Error>,
    ) -> Option<DecoderFailure> {
        self.transition(ProcessState::Stopping, "decoder exited too fast");
        let report = self.finish_cleanup(process).await;
        let diagnostics = report.map(|r| r.diagnostics).unwrap_or_default();
        let err = match read_error {
            Some(source) => StreamError::Read { source },
            None => StreamError::Exited { ran_for },
        };
        warn!(
            source = %self.label,
            pid = process.pid(),
            ran_for_ms = ran_for.as_millis() as u64,
            error = %err,
            diagnostics = %diagnostics.trim(),
            "decoder exited shortly after start"
        );
        self.set_last_error(&err);
        let failure = classify(&diagnostics);
        self.bus.publish(
            self.event(EventKind::FastExit)
                .with_pid(process.pid())
                .with_delay(ran_for)
                .with_reason(diagnostics),
        );
        failure
    }

    /// Accounts for a failed attempt after its cleanup.
    ///
    /// Returns `Err` once `permanent_failure_limit` permanent failures happened
    /// in a row; the supervisor must not restart after that.
    async fn failed_attempt(
        &self,
        process: &DecoderProcess,
        ran_for: Duration,
        failure: Option<DecoderFailure>,
        permanent_failures: &mut u32,
    ) -> Result<(), StreamError> {
        let bytes = self.process_bytes.load(Ordering::Relaxed);
        if bytes > 0 {
            *permanent_failures = 0;
        }
        let permanent = failure.as_ref().is_some_and(|f| f.is_permanent());
        if permanent {
            *permanent_failures = permanent_failures.saturating_add(1);
        }

        if let Some(failure) = &failure {
            warn!(
                source = %self.label,
                pid = process.pid(),
                kind = failure.kind.as_label(),
                permanent,
                consecutive = *permanent_failures,
                "decoder failed: {}",
                failure
            );
            self.set_last_error(&StreamError::Decoder {
                failure: failure.clone(),
            });
            self.bus.publish(
                self.event(EventKind::DecoderError)
                    .with_pid(process.pid())
                    .with_attempt(if permanent { *permanent_failures } else { 0 })
                    .with_reason(failure.kind.as_label()),
            );
        }

        if let Some(failure) = failure.filter(|f| f.is_permanent()) {
            let limit = self.cfg.permanent_failure_limit;
            if limit > 0 && *permanent_failures >= limit {
                self.transition(ProcessState::Idle, "permanent decoder failure");
                return Err(self.fatal(StreamError::PermanentFailure {
                    failure,
                    attempts: *permanent_failures,
                }));
            }
        }

        self.record_circuit_failure(ran_for, bytes, permanent);
        Ok(())
    }

    fn record_circuit_failure(&self, ran_for: Duration, bytes: u64, permanent: bool) {
        let Some(circuit) = &self.circuit else {
            return;
        };
        let (opened, failures, cooldown) = {
            let mut cb = circuit.lock().unwrap_or_else(|e| e.into_inner());
            cb.record_stable(ran_for, bytes);
            let was_open = cb.is_open();
            let mut opened = cb.record_failure(ran_for);
            if permanent && !was_open && opened.is_none() {
                cb.trip();
                opened = Some("permanent_failure");
            }
            (opened, cb.failures(), cb.policy().cooldown)
        };
        if let Some(reason) = opened {
            error!(
                source = %self.label,
                failures,
                ran_for_ms = ran_for.as_millis() as u64,
                cooldown_ms = cooldown.as_millis() as u64,
                reason,
                "circuit breaker opened"
            );
            self.bus.publish(
                self.event(EventKind::CircuitOpened)
                    .with_attempt(failures)
                    .with_delay(cooldown)
                    .with_reason(reason),
            );
        }
    }

    /// Remaining circuit breaker cooldown, if the breaker is open.
    fn circuit_cooldown(&self) -> Option<Duration> {
        self.circuit
            .as_ref()?
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remaining()
    }

    /// Records a failure restart and waits the backoff delay, or the remaining
    /// circuit cooldown when the breaker is open. Returns `true` if the supervisor
    /// should exit instead of restarting.
    async fn restart_after_failure(&self) -> bool {
        self.transition(ProcessState::Idle, "decoder cleaned up");
        let count = self
            .restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record();
        let delay = match self.circuit_cooldown() {
            Some(remaining) => {
                warn!(
                    source = %self.label,
                    remaining_ms = remaining.as_millis() as u64,
                    "circuit breaker open, waiting for cooldown"
                );
                remaining
            }
            None => self.cfg.backoff.next(count),
        };
        info!(
            source = %self.label,
            restart_count = count,
            delay_ms = delay.as_millis() as u64,
            "restarting decoder after backoff"
        );
        match self.wait_backoff(delay, count).await {
            Wait::Cancelled => true,
            Wait::Restart | Wait::Elapsed => false,
        }
    }

    async fn wait_backoff(&self, delay: Duration, attempt: u32) -> Wait {
        self.bus.publish(
            self.event(EventKind::BackoffScheduled)
                .with_attempt(attempt)
                .with_delay(delay),
        );
        tokio::select! {
            _ = self.token.cancelled() => Wait::Cancelled,
            _ = self.restart.recv() => {
                self.apply_manual_reset();
                Wait::Restart
            }
            _ = tokio::time::sleep(delay) => Wait::Elapsed,
        }
    }

    fn apply_manual_reset(&self) {
        if self.manual_restart.swap(false, Ordering::AcqRel) {
            self.restarts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
        }
    }

    fn should_exit(&self) -> bool {
        self.is_stopped() || self.token.is_cancelled() || !self.desired.contains(self.source.id())
    }

    fn fatal(&self, err: StreamError) -> StreamError {
        error!(source = %self.label, error = %err, kind = err.as_label(), "stream stopped permanently");
        self.set_last_error(&err);
        self.bus
            .publish(self.event(EventKind::StreamFatal).with_reason(err.to_string()));
        err
    }

    fn set_last_error(&self, err: &StreamError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    fn transition(&self, to: ProcessState, reason: &str) {
        let change = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let from = history.current();
            if from != to && !from.can_transition_to(to) {
                debug!(source = %self.label, %from, %to, reason, "unexpected state transition");
            }
            history.transition(to, reason)
        };
        if let Some(change) = change {
            self.bus.publish(
                self.event(EventKind::StateChanged)
                    .with_transition(change.from, change.to)
                    .with_reason(reason),
            );
        }
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind)
            .with_source(self.label.clone())
            .with_instance(self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioLevel, NullSink};
    use crate::source::Transport;

    struct NeverCommand;

    impl DecoderCommand for NeverCommand {
        fn command(&self, _source: &SourceDescriptor) -> Result<tokio::process::Command, StreamError> {
            Err(StreamError::Config {
                reason: "decoder path is empty".into(),
            })
        }
    }

    /// Spawn fails with a transient error every time.
    struct BrokenSpawn;

    impl DecoderCommand for BrokenSpawn {
        fn command(&self, _source: &SourceDescriptor) -> Result<tokio::process::Command, StreamError> {
            Err(StreamError::Spawn {
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "not executable"),
            })
        }
    }

    struct RemovedSink;

    impl AudioSink for RemovedSink {
        fn write_analysis(&self, _: &str, _: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::SourceRemoved)
        }
        fn write_capture(&self, _: &str, _: &[u8]) -> Result<(), SinkError> {
            Ok(())
        }
        fn broadcast(&self, _: &str, _: &[u8]) {}
        fn audio_level(&self, _: &[u8], _: &str) -> AudioLevel {
            AudioLevel::default()
        }
    }

    fn supervisor(
        decoder: Arc<dyn DecoderCommand>,
        sink: Arc<dyn AudioSink>,
        cfg: StreamConfig,
        capacity: usize,
    ) -> (Arc<StreamSupervisor>, mpsc::Receiver<AudioEvent>, Bus) {
        let desired = DesiredSources::new();
        desired.insert("rtsp://cam/1");
        let bus = Bus::new(256);
        let (tx, rx) = mpsc::channel(capacity);
        let sup = StreamSupervisor::new(
            SourceDescriptor::new("rtsp://cam/1", Transport::Tcp),
            cfg,
            SupervisorDeps {
                decoder,
                sink,
                desired,
                bus: bus.clone(),
            },
            tx,
            &CancellationToken::new(),
        );
        (sup, rx, bus)
    }

    #[tokio::test]
    async fn test_config_error_is_fatal() {
        let (sup, _rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(NullSink),
            StreamConfig::default(),
            4,
        );
        let err = Arc::clone(&sup).run().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(sup.is_finished());
        assert_eq!(sup.state(), ProcessState::Idle);
        assert!(sup.health().last_error.is_some());
    }

    #[test]
    fn test_full_output_drops_newest() {
        let (sup, mut rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(NullSink),
            StreamConfig::default(),
            2,
        );
        for _ in 0..5 {
            assert!(matches!(sup.process_chunk(&[0u8; 64]), ChunkOutcome::Continue));
        }
        assert_eq!(sup.health().dropped_events, 3);
        assert_eq!(sup.health().total_bytes, 5 * 64);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pending_restart_short_circuits_chunk() {
        let (sup, _rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(NullSink),
            StreamConfig::default(),
            8,
        );
        sup.restart(false);
        sup.restart(false);
        assert!(sup.is_restarting());
        assert!(matches!(sup.process_chunk(b"pcm"), ChunkOutcome::Restart));
        assert!(matches!(sup.process_chunk(b"pcm"), ChunkOutcome::Continue));
    }

    #[test]
    fn test_source_removed_is_fatal_chunk() {
        let (sup, _rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(RemovedSink),
            StreamConfig::default(),
            8,
        );
        assert!(matches!(
            sup.process_chunk(b"pcm"),
            ChunkOutcome::Fatal(StreamError::Sink { .. })
        ));
    }

    #[test]
    fn test_health_follows_data_of_current_process() {
        let (sup, _rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(NullSink),
            StreamConfig::default(),
            8,
        );
        let before = sup.health();
        assert_eq!(before.last_data_age, None);
        assert!(!before.is_healthy);
        assert!(!before.is_receiving_data);
        assert_eq!(before.bytes_per_sec, 0.0);

        sup.process_chunk(&[0u8; 512]);
        let after = sup.health();
        assert!(after.last_data_age.is_some());
        assert!(after.is_healthy);
        assert!(after.is_receiving_data);
        assert!(after.bytes_per_sec > 0.0);
        assert!(!after.circuit_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failures_back_off_exponentially() {
        let cfg = StreamConfig {
            backoff: crate::policies::BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_secs(10),
                jitter: crate::policies::JitterPolicy::None,
            },
            ..StreamConfig::default()
        };
        let (sup, _rx, bus) = supervisor(Arc::new(BrokenSpawn), Arc::new(NullSink), cfg, 8);
        let mut events = bus.subscribe();
        let run = tokio::spawn(Arc::clone(&sup).run());

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::BackoffScheduled {
                seen.push((ev.attempt, ev.delay_ms));
            }
        }
        assert_eq!(
            seen,
            vec![(Some(1), Some(50)), (Some(2), Some(100)), (Some(3), Some(200))]
        );
        assert_eq!(sup.pid(), None);
        assert!(sup.health().last_error.is_some());

        sup.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_cuts_spawn_backoff_short() {
        let cfg = StreamConfig {
            backoff: crate::policies::BackoffPolicy {
                base: Duration::from_secs(10),
                max: Duration::from_secs(60),
                jitter: crate::policies::JitterPolicy::None,
            },
            ..StreamConfig::default()
        };
        let (sup, _rx, bus) = supervisor(Arc::new(BrokenSpawn), Arc::new(NullSink), cfg, 8);
        let mut events = bus.subscribe();
        let run = tokio::spawn(Arc::clone(&sup).run());

        async fn spawn_failed(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
            loop {
                let ev = events.recv().await.unwrap();
                if ev.kind == EventKind::SpawnFailed {
                    return ev;
                }
            }
        }

        let first = tokio::time::timeout(Duration::from_secs(2), spawn_failed(&mut events))
            .await
            .unwrap();
        assert_eq!(first.attempt, Some(1));

        sup.restart(false);
        let second = tokio::time::timeout(Duration::from_secs(2), spawn_failed(&mut events))
            .await
            .expect("restart must end the 10s wait");
        assert_eq!(second.attempt, Some(1));

        sup.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let (sup, _rx, _bus) = supervisor(
            Arc::new(NeverCommand),
            Arc::new(NullSink),
            StreamConfig::default(),
            8,
        );
        sup.stop().await;
        assert!(sup.is_stopped());
        sup.restart(true);
        assert!(!sup.is_restarting());
        assert!(Arc::clone(&sup).run().await.is_ok());
    }

    #[cfg(target_os = "linux")]
    mod process {
        use super::*;
        use crate::process::testing::{is_zombie, ShellCommand};
        use tokio::sync::broadcast;

        fn fast_config() -> StreamConfig {
            StreamConfig {
                watchdog_tick: Duration::from_millis(50),
                silence_timeout: Duration::from_millis(400),
                fast_exit_threshold: Duration::from_secs(2),
                cleanup_timeout: Duration::from_millis(500),
                reap_timeout: Duration::from_secs(2),
                backoff: crate::policies::BackoffPolicy {
                    base: Duration::from_millis(50),
                    max: Duration::from_millis(200),
                    jitter: crate::policies::JitterPolicy::None,
                },
                ..StreamConfig::default()
            }
        }

        async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    match rx.recv().await {
                        Ok(ev) if ev.kind == kind => return ev,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
                    }
                }
            })
            .await
            .expect("event not observed in time")
        }

        #[tokio::test]
        async fn test_large_write_then_exit_is_fully_read() {
            let (sup, mut rx, bus) = supervisor(
                Arc::new(ShellCommand("head -c 40960 /dev/zero; sleep 3")),
                Arc::new(NullSink),
                StreamConfig {
                    fast_exit_threshold: Duration::from_millis(500),
                    silence_timeout: Duration::from_secs(30),
                    ..fast_config()
                },
                1024,
            );
            let mut events = bus.subscribe();
            let before = sup.watchdog().last_data();
            let run = tokio::spawn(Arc::clone(&sup).run());

            let started = next_of(&mut events, EventKind::ProcessStarted).await;
            let pid = started.pid.unwrap();
            next_of(&mut events, EventKind::ProcessExited).await;

            assert!(sup.health().total_bytes >= 40960);
            assert!(sup.watchdog().last_data() > before);
            let mut received = 0;
            while rx.try_recv().is_ok() {
                received += 1;
            }
            assert!(received > 0);

            sup.stop().await;
            run.await.unwrap().unwrap();
            assert!(!is_zombie(pid));
        }

        #[tokio::test]
        async fn test_fast_exit_reports_diagnostics() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("echo '401 Unauthorized' >&2; exit 1")),
                Arc::new(NullSink),
                fast_config(),
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());

            let ev = next_of(&mut events, EventKind::FastExit).await;
            assert!(ev.reason.as_deref().unwrap_or_default().contains("401 Unauthorized"));
            let backoff = next_of(&mut events, EventKind::BackoffScheduled).await;
            assert_eq!(backoff.attempt, Some(1));

            sup.stop().await;
            run.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_silent_decoder_restarted_by_watchdog() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("sleep 30")),
                Arc::new(NullSink),
                fast_config(),
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());

            let first = next_of(&mut events, EventKind::ProcessStarted).await;
            next_of(&mut events, EventKind::WatchdogTimeout).await;
            let second = next_of(&mut events, EventKind::ProcessStarted).await;
            assert_ne!(first.pid, second.pid);
            assert!(sup.restart_count() >= 1);
            assert!(!is_zombie(first.pid.unwrap()));

            sup.stop().await;
            run.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_leaves_when_no_longer_desired() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("sleep 30")),
                Arc::new(NullSink),
                fast_config(),
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());
            let started = next_of(&mut events, EventKind::ProcessStarted).await;

            sup.desired().remove("rtsp://cam/1");
            tokio::time::timeout(Duration::from_secs(10), run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(sup.state(), ProcessState::Idle);
            assert!(!is_zombie(started.pid.unwrap()));
        }

        #[tokio::test]
        async fn test_silent_decoder_is_not_healthy() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("sleep 30")),
                Arc::new(NullSink),
                StreamConfig {
                    silence_timeout: Duration::from_secs(30),
                    ..fast_config()
                },
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());
            next_of(&mut events, EventKind::ProcessStarted).await;

            let health = sup.health();
            assert_eq!(health.state, ProcessState::Running);
            assert!(health.pid.is_some());
            assert_eq!(health.last_data_age, None);
            assert!(!health.is_healthy);
            assert!(!health.is_receiving_data);

            sup.stop().await;
            run.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_missing_decoder_is_not_retried() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(crate::process::FfmpegCommand::new("streamvisor-no-such-decoder")),
                Arc::new(NullSink),
                fast_config(),
                8,
            );
            let mut events = bus.subscribe();
            let res = tokio::time::timeout(Duration::from_secs(5), Arc::clone(&sup).run())
                .await
                .expect("run must return instead of retrying");
            assert!(matches!(res, Err(StreamError::Config { .. })));
            next_of(&mut events, EventKind::StreamFatal).await;
            assert_eq!(sup.pid(), None);
        }

        #[tokio::test]
        async fn test_repeated_auth_failure_gives_up() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand(
                    "echo '[rtsp @ 0x1] method DESCRIBE failed: 401 Unauthorized' >&2; exit 1",
                )),
                Arc::new(NullSink),
                StreamConfig {
                    permanent_failure_limit: 2,
                    ..fast_config()
                },
                8,
            );
            let mut events = bus.subscribe();
            let res = tokio::time::timeout(Duration::from_secs(10), Arc::clone(&sup).run())
                .await
                .expect("supervisor must give up");

            match res {
                Err(StreamError::PermanentFailure { failure, attempts }) => {
                    assert_eq!(attempts, 2);
                    assert_eq!(failure.kind, crate::process::FailureKind::Unauthorized);
                    assert_eq!(failure.status, Some(401));
                }
                other => panic!("expected permanent failure, got {other:?}"),
            }
            let first = next_of(&mut events, EventKind::DecoderError).await;
            assert_eq!(first.reason.as_deref(), Some("auth_failed"));
            assert_eq!(first.attempt, Some(1));
            next_of(&mut events, EventKind::StreamFatal).await;
            assert_eq!(sup.state(), ProcessState::Idle);
        }

        #[tokio::test]
        async fn test_early_stderr_failure_restarts_decoder() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("echo 'Connection refused' >&2; sleep 30")),
                Arc::new(NullSink),
                StreamConfig {
                    silence_timeout: Duration::from_secs(30),
                    early_error_window: Duration::from_secs(2),
                    early_error_poll: Duration::from_millis(50),
                    ..fast_config()
                },
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());

            let first = next_of(&mut events, EventKind::ProcessStarted).await;
            let err = next_of(&mut events, EventKind::DecoderError).await;
            assert_eq!(err.reason.as_deref(), Some("connection_refused"));
            let second = next_of(&mut events, EventKind::ProcessStarted).await;
            assert_ne!(first.pid, second.pid);
            assert!(!is_zombie(first.pid.unwrap()));
            assert!(sup
                .health()
                .last_error
                .is_some_and(|e| e.contains("connection_refused")));

            sup.stop().await;
            run.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_circuit_breaker_replaces_backoff_with_cooldown() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("exit 1")),
                Arc::new(NullSink),
                StreamConfig {
                    circuit_breaker: Some(crate::policies::CircuitBreakerPolicy {
                        immediate_threshold: 2,
                        cooldown: Duration::from_millis(300),
                        ..Default::default()
                    }),
                    ..fast_config()
                },
                8,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());

            let opened = next_of(&mut events, EventKind::CircuitOpened).await;
            assert_eq!(opened.reason.as_deref(), Some("immediate_failures"));
            assert_eq!(opened.attempt, Some(2));
            assert!(sup.health().circuit_open);

            let wait = next_of(&mut events, EventKind::BackoffScheduled).await;
            let delay = wait.delay_ms.unwrap();
            assert!((250..=300).contains(&delay), "delay {delay}");

            sup.stop().await;
            run.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_concurrent_restarts_and_cleanup_leave_no_zombie() {
            let (sup, _rx, bus) = supervisor(
                Arc::new(ShellCommand("while :; do head -c 512 /dev/zero; sleep 0.05; done")),
                Arc::new(NullSink),
                fast_config(),
                64,
            );
            let mut events = bus.subscribe();
            let run = tokio::spawn(Arc::clone(&sup).run());
            let started = next_of(&mut events, EventKind::ProcessStarted).await;

            let restarts = (0..5).map(|_| {
                let sup = Arc::clone(&sup);
                tokio::spawn(async move { sup.restart(true) })
            });
            let cleanup = {
                let sup = Arc::clone(&sup);
                tokio::spawn(async move {
                    if let Some(p) = sup.current_process() {
                        sup.finish_cleanup(&p).await;
                    }
                })
            };
            for r in futures::future::join_all(restarts).await {
                r.unwrap();
            }
            cleanup.await.unwrap();

            let next = next_of(&mut events, EventKind::ProcessStarted).await;
            assert_ne!(next.pid, started.pid);

            sup.stop().await;
            run.await.unwrap().unwrap();
            assert!(!is_zombie(started.pid.unwrap()));
            assert!(!is_zombie(next.pid.unwrap()));
            assert_eq!(sup.pid(), None);
        }
    }
}
