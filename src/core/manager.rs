//! # SupervisorManager: registry of stream supervisors.
//!
//! The manager owns every [`StreamSupervisor`], keyed by source id, and is the
//! only way the rest of the system touches them.
//!
//! ## Architecture
//! ```text
//! reconcile(desired) ──► diff registry vs desired
//!                          ├─ missing      ──► start(source)
//!                          ├─ removed      ──► stop(id)
//!                          └─ transport Δ  ──► stop(id) then start(source)
//!
//! start(source) ──► registry.insert(id, StreamEntry { supervisor, task })
//!                     └─► tracker.spawn(supervisor.run())
//!                            └─ run returned ─► remove entry (same instance only)
//!
//! stop(id) ──► registry.remove(id), desired.remove(id)   (one write lock)
//!               └─► tracker.spawn(supervisor.stop(); join run task)
//!                      └─► publish StreamRemoved
//!
//! monitor (every monitor_interval)
//!   └─► for each unhealthy, not restarting, past output grace ─► restart(automatic)
//! ```
//!
//! ## Rules
//! - The registry is one `RwLock<HashMap>`; health queries take the read lock only
//!   long enough to clone the supervisor handles.
//! - A transport change always produces a new supervisor instance.
//! - The desired set is only changed while holding the registry write lock, so a
//!   registered source is always desired unless it is being torn down.
//! - A supervisor whose `run` returned on its own (fatal error, source no longer
//!   desired) is dropped from the registry by its run task.
//! - `stop` never blocks on process cleanup; `shutdown` waits for all of them, bounded by `grace`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::audio::{AudioEvent, AudioSink};
use crate::core::builder::ManagerBuilder;
use crate::core::config::ManagerConfig;
use crate::core::health::HealthSnapshot;
use crate::core::shutdown;
use crate::core::supervisor::{StreamSupervisor, SupervisorDeps};
use crate::error::{ManagerError, StreamError};
use crate::events::{Bus, Event, EventKind};
use crate::process::DecoderCommand;
use crate::source::{sanitize_url, DesiredSources, SourceConfig, SourceDescriptor};

/// Registry entry for one running source.
struct StreamEntry {
    supervisor: Arc<StreamSupervisor>,
    task: JoinHandle<()>,
}

/// Changes applied by one [`SupervisorManager::reconcile`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sources started fresh.
    pub started: Vec<String>,
    /// Sources stopped because they left the configuration.
    pub stopped: Vec<String>,
    /// Sources recreated because their transport changed.
    pub recreated: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.recreated.is_empty()
    }
}

/// Owns all stream supervisors and converges them on a desired configuration.
pub struct SupervisorManager {
    cfg: ManagerConfig,
    bus: Bus,
    streams: RwLock<HashMap<String, StreamEntry>>,
    desired: DesiredSources,
    decoder: Arc<dyn DecoderCommand>,
    sink: Arc<dyn AudioSink>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SupervisorManager {
    /// Returns a builder with the given configuration.
    pub fn builder(cfg: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: ManagerConfig,
        decoder: Arc<dyn DecoderCommand>,
        sink: Arc<dyn AudioSink>,
    ) -> Arc<Self> {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        Arc::new(Self {
            cfg,
            bus,
            streams: RwLock::new(HashMap::new()),
            desired: DesiredSources::new(),
            decoder,
            sink,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        })
    }

    /// Subscribes to supervision events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    /// Starts supervising `source`, delivering audio events on `output`.
    ///
    /// Returns the new supervisor's instance id, or [`ManagerError::AlreadyExists`]
    /// if the source is already registered.
    pub async fn start(
        self: &Arc<Self>,
        source: SourceDescriptor,
        output: mpsc::Sender<AudioEvent>,
    ) -> Result<u64, ManagerError> {
        let id = source.id().to_string();
        let mut streams = self.streams.write().await;
        if streams.contains_key(&id) {
            return Err(ManagerError::AlreadyExists {
                source_id: source.safe_display(),
            });
        }

        self.desired.insert(&id);
        let supervisor = StreamSupervisor::new(
            source,
            self.cfg.stream.clone(),
            SupervisorDeps {
                decoder: Arc::clone(&self.decoder),
                sink: Arc::clone(&self.sink),
                desired: self.desired.clone(),
                bus: self.bus.clone(),
            },
            output,
            &self.token,
        );
        let instance = supervisor.instance_id();
        let task = self.spawn_run(Arc::clone(&supervisor));
        streams.insert(
            id,
            StreamEntry {
                supervisor: Arc::clone(&supervisor),
                task,
            },
        );
        drop(streams);

        let label = supervisor.source().safe_display();
        info!(
            source = %label,
            instance,
            transport = %supervisor.source().transport(),
            "stream added"
        );
        self.bus.publish(
            Event::new(EventKind::StreamAdded)
                .with_source(label)
                .with_instance(instance)
                .with_reason(supervisor.source().transport().as_str()),
        );
        Ok(instance)
    }

    /// Removes `source_id` from the registry and tears its supervisor down in the background.
    pub async fn stop(&self, source_id: &str) -> Result<(), ManagerError> {
        let entry = {
            let mut streams = self.streams.write().await;
            let entry = streams.remove(source_id);
            if entry.is_some() {
                self.desired.remove(source_id);
            }
            entry
        };
        let Some(entry) = entry else {
            return Err(ManagerError::NotFound {
                source_id: sanitize_url(source_id),
            });
        };
        self.spawn_teardown(entry, "stopped");
        Ok(())
    }

    /// Requests a restart of an existing supervisor, keeping its transport and counters.
    pub async fn restart(&self, source_id: &str) -> Result<(), ManagerError> {
        let supervisor = self
            .streams
            .read()
            .await
            .get(source_id)
            .map(|e| Arc::clone(&e.supervisor));
        match supervisor {
            Some(supervisor) => {
                supervisor.restart(false);
                Ok(())
            }
            None => Err(ManagerError::NotFound {
                source_id: sanitize_url(source_id),
            }),
        }
    }

    /// Health of every registered source.
    pub async fn health_check(&self) -> HashMap<String, HealthSnapshot> {
        self.supervisors()
            .await
            .into_iter()
            .map(|(id, sup)| (id, sup.health()))
            .collect()
    }

    /// Sorted ids of all registered sources.
    pub async fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Converges the registry on `desired`.
    ///
    /// New sources are started, missing ones stopped, and sources whose transport
    /// changed are stopped and started again as a new instance.
    pub async fn reconcile(
        self: &Arc<Self>,
        desired: &[SourceConfig],
        output: &mpsc::Sender<AudioEvent>,
    ) -> ReconcileReport {
        let mut wanted: HashMap<&str, &SourceConfig> = HashMap::new();
        for cfg in desired {
            wanted.entry(cfg.url.as_str()).or_insert(cfg);
        }
        let running: HashMap<String, crate::source::Transport> = {
            let streams = self.streams.write().await;
            self.desired.replace(wanted.keys().copied());
            streams
                .iter()
                .map(|(id, e)| (id.clone(), e.supervisor.source().transport()))
                .collect()
        };

        let mut report = ReconcileReport::default();

        for (id, transport) in &running {
            match wanted.get(id.as_str()) {
                None => {
                    if self.stop(id).await.is_ok() {
                        report.stopped.push(sanitize_url(id));
                    }
                }
                Some(cfg) if cfg.transport != *transport => {
                    info!(
                        source = %sanitize_url(id),
                        from = %transport,
                        to = %cfg.transport,
                        "transport changed, recreating stream"
                    );
                    if let Err(e) = self.stop(id).await {
                        debug!(error = %e, "stream already gone before recreate");
                    }
                    match self.start(cfg.descriptor(), output.clone()).await {
                        Ok(_) => report.recreated.push(sanitize_url(id)),
                        Err(e) => warn!(error = %e, "failed to recreate stream"),
                    }
                }
                Some(_) => {}
            }
        }

        for (id, cfg) in &wanted {
            if running.contains_key(*id) {
                continue;
            }
            match self.start(cfg.descriptor(), output.clone()).await {
                Ok(_) => report.started.push(sanitize_url(id)),
                Err(e) => warn!(error = %e, "failed to start stream"),
            }
        }

        report.started.sort_unstable();
        report.stopped.sort_unstable();
        report.recreated.sort_unstable();
        if !report.is_empty() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                recreated = report.recreated.len(),
                "streams reconciled"
            );
        }
        report
    }

    /// Stops every supervisor and waits up to `grace` for their cleanup.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.token.cancel();
        let drained: Vec<(String, StreamEntry)> = {
            let mut streams = self.streams.write().await;
            self.desired.replace(std::iter::empty::<String>());
            streams.drain().collect()
        };
        info!(streams = drained.len(), "shutting down streams");

        // Stops run as a tracked task so cleanups finish even past the grace period.
        let supervisors: Vec<Arc<StreamSupervisor>> = drained
            .iter()
            .map(|(_, e)| Arc::clone(&e.supervisor))
            .collect();
        self.tracker.spawn(async move {
            join_all(supervisors.iter().map(|s| s.stop())).await;
        });
        self.tracker.close();

        let grace = self.cfg.grace;
        let timed = tokio::time::timeout(grace, self.tracker.wait()).await;

        for (_, entry) in &drained {
            self.publish_removed(&entry.supervisor, Some("shutdown"));
        }

        match timed {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<String> = drained
                    .iter()
                    .filter(|(_, e)| !e.task.is_finished())
                    .map(|(id, _)| sanitize_url(id))
                    .collect();
                warn!(?grace, ?stuck, "shutdown grace exceeded");
                self.bus.publish(
                    Event::new(EventKind::GraceExceeded).with_reason(stuck.join(", ")),
                );
                Err(ManagerError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Waits for SIGINT/SIGTERM (Ctrl-C elsewhere), then shuts down.
    pub async fn run_until_signal(&self) -> Result<(), ManagerError> {
        if let Err(e) = shutdown::wait_for_shutdown_signal().await {
            warn!(error = %e, "signal handler unavailable, shutting down");
        }
        self.shutdown().await
    }

    /// Spawns the periodic health monitor if enabled.
    pub(crate) fn spawn_monitor(self: &Arc<Self>) {
        let Some(period) = self.cfg.monitor_interval() else {
            return;
        };
        let me: Weak<Self> = Arc::downgrade(self);
        let token = self.token.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = me.upgrade() else { break };
                        manager.sweep().await;
                    }
                }
            }
        });
    }

    /// Restarts streams that stopped producing data.
    async fn sweep(&self) {
        let grace = self.cfg.stream.output_grace_period;
        for (id, sup) in self.supervisors().await {
            let health = sup.health();
            let past_grace = health.process_uptime.is_some_and(|up| up > grace);
            if health.is_healthy || sup.is_restarting() || !past_grace {
                continue;
            }
            warn!(
                source = %sanitize_url(&id),
                last_data_ms = ?health.last_data_age.map(|age| age.as_millis() as u64),
                restart_count = health.restart_count,
                "stream unhealthy, requesting restart"
            );
            sup.restart(false);
        }
    }

    async fn supervisors(&self) -> Vec<(String, Arc<StreamSupervisor>)> {
        self.streams
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.supervisor)))
            .collect()
    }

    fn spawn_run(self: &Arc<Self>, supervisor: Arc<StreamSupervisor>) -> JoinHandle<()> {
        let me = Arc::downgrade(self);
        self.tracker.spawn(async move {
            let res = Arc::clone(&supervisor).run().await;
            if let Some(manager) = me.upgrade() {
                manager.remove_exited(&supervisor, res.err().as_ref()).await;
            }
        })
    }

    /// Drops a supervisor whose run ended on its own, unless it was already
    /// removed or replaced by a newer instance.
    async fn remove_exited(&self, supervisor: &Arc<StreamSupervisor>, err: Option<&StreamError>) {
        let id = supervisor.source().id();
        let removed = {
            let mut streams = self.streams.write().await;
            let same = streams
                .get(id)
                .is_some_and(|e| e.supervisor.instance_id() == supervisor.instance_id());
            if same {
                self.desired.remove(id);
                streams.remove(id)
            } else {
                None
            }
        };
        if removed.is_some() {
            let reason = err.map_or("no_longer_desired", |e| e.as_label());
            debug!(source = %supervisor.source().safe_display(), reason, "stream exited on its own");
            self.publish_removed(supervisor, Some(reason));
        }
    }

    fn spawn_teardown(&self, entry: StreamEntry, reason: &'static str) {
        let bus = self.bus.clone();
        self.tracker.spawn(async move {
            entry.supervisor.stop().await;
            if let Err(e) = entry.task.await {
                warn!(error = %e, "stream task failed");
            }
            debug!(source = %entry.supervisor.source().safe_display(), "stream torn down");
            bus.publish(removed_event(&entry.supervisor, Some(reason)));
        });
    }

    fn publish_removed(&self, supervisor: &StreamSupervisor, reason: Option<&str>) {
        self.bus.publish(removed_event(supervisor, reason));
    }
}

fn removed_event(supervisor: &StreamSupervisor, reason: Option<&str>) -> Event {
    let mut ev = Event::new(EventKind::StreamRemoved)
        .with_source(supervisor.source().safe_display())
        .with_instance(supervisor.instance_id());
    if let Some(reason) = reason {
        ev = ev.with_reason(reason);
    }
    ev
}

impl Drop for SupervisorManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StreamConfig;
    use crate::source::Transport;

    struct EmptyPath;

    impl DecoderCommand for EmptyPath {
        fn command(&self, _source: &SourceDescriptor) -> Result<tokio::process::Command, StreamError> {
            Err(StreamError::Config {
                reason: "decoder path is empty".into(),
            })
        }
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            monitor_interval: Duration::ZERO,
            grace: Duration::from_secs(5),
            stream: StreamConfig {
                cleanup_timeout: Duration::from_millis(500),
                reap_timeout: Duration::from_secs(1),
                ..StreamConfig::default()
            },
            ..ManagerConfig::default()
        }
    }

    async fn removed(rx: &mut broadcast::Receiver<Event>, instance: u64) -> Event {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.kind == EventKind::StreamRemoved && ev.instance == Some(instance) => {
                        return ev
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
                }
            }
        })
        .await
        .expect("stream not removed in time")
    }

    #[tokio::test]
    async fn test_config_error_removes_entry() {
        let manager = SupervisorManager::builder(config())
            .with_decoder(Arc::new(EmptyPath))
            .build();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);

        let instance = manager
            .start(SourceDescriptor::new("rtsp://cam/1", Transport::Tcp), tx)
            .await
            .unwrap();
        let ev = removed(&mut events, instance).await;
        assert_eq!(ev.reason.as_deref(), Some("stream_config"));
        assert!(manager.active_streams().await.is_empty());
        assert!(manager.health_check().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let manager = SupervisorManager::builder(config()).build();
        let err = manager.stop("rtsp://admin:pw@cam/9").await.unwrap_err();
        assert_eq!(err.to_string(), "no stream found: rtsp://cam/9");
        assert!(matches!(
            manager.restart("rtsp://cam/9").await,
            Err(ManagerError::NotFound { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    mod process {
        use super::*;
        use crate::process::testing::{is_zombie, ShellCommand};

        fn manager() -> Arc<SupervisorManager> {
            SupervisorManager::builder(config())
                .with_decoder(Arc::new(ShellCommand(
                    "while :; do head -c 1024 /dev/zero; sleep 0.1; done",
                )))
                .build()
        }

        #[tokio::test]
        async fn test_duplicate_start_rejected() {
            let manager = manager();
            let (tx, _rx) = mpsc::channel(64);
            let src = SourceDescriptor::new("rtsp://cam/1", Transport::Tcp);

            manager.start(src.clone(), tx.clone()).await.unwrap();
            let err = manager.start(src, tx).await.unwrap_err();
            assert_eq!(err.to_string(), "stream already exists: rtsp://cam/1");
            assert_eq!(manager.active_streams().await, vec!["rtsp://cam/1".to_string()]);

            manager.shutdown().await.unwrap();
            assert!(manager.active_streams().await.is_empty());
        }

        #[tokio::test]
        async fn test_stop_then_start_sees_no_old_entry() {
            let manager = manager();
            let (tx, _rx) = mpsc::channel(64);
            let src = SourceDescriptor::new("rtsp://cam/1", Transport::Tcp);

            let first = manager.start(src.clone(), tx.clone()).await.unwrap();
            manager.stop(src.id()).await.unwrap();
            let second = manager.start(src, tx).await.unwrap();
            assert_ne!(first, second);

            manager.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_reconcile_transport_change_recreates() {
            let manager = manager();
            let mut events = manager.subscribe();
            let (tx, _rx) = mpsc::channel(64);

            let report = manager
                .reconcile(&[SourceConfig::new("rtsp://cam/1", Transport::Tcp)], &tx)
                .await;
            assert_eq!(report.started, vec!["rtsp://cam/1".to_string()]);
            let before = manager.health_check().await["rtsp://cam/1"].instance;

            let report = manager
                .reconcile(&[SourceConfig::new("rtsp://cam/1", Transport::Udp)], &tx)
                .await;
            assert_eq!(report.recreated, vec!["rtsp://cam/1".to_string()]);

            let health = manager.health_check().await;
            let after = &health["rtsp://cam/1"];
            assert_ne!(after.instance, before);
            assert_eq!(after.transport, Transport::Udp);
            removed(&mut events, before).await;

            let report = manager
                .reconcile(&[SourceConfig::new("rtsp://cam/1", Transport::Udp)], &tx)
                .await;
            assert!(report.is_empty());

            let report = manager.reconcile(&[], &tx).await;
            assert_eq!(report.stopped, vec!["rtsp://cam/1".to_string()]);
            removed(&mut events, after.instance).await;
            assert!(manager.health_check().await.is_empty());
        }

        #[tokio::test]
        async fn test_restart_preserves_instance() {
            let manager = manager();
            let mut events = manager.subscribe();
            let (tx, _rx) = mpsc::channel(64);
            let src = SourceDescriptor::new("rtsp://cam/1", Transport::Tcp);
            let instance = manager.start(src.clone(), tx).await.unwrap();

            let first_pid = loop {
                let ev = events.recv().await.unwrap();
                if ev.kind == EventKind::ProcessStarted {
                    break ev.pid.unwrap();
                }
            };
            manager.restart(src.id()).await.unwrap();
            let second_pid = loop {
                let ev = events.recv().await.unwrap();
                if ev.kind == EventKind::ProcessStarted {
                    break ev.pid.unwrap();
                }
            };

            assert_ne!(first_pid, second_pid);
            assert!(!is_zombie(first_pid));
            let health = manager.health_check().await;
            assert_eq!(health["rtsp://cam/1"].instance, instance);
            assert_eq!(health["rtsp://cam/1"].transport, Transport::Tcp);

            manager.shutdown().await.unwrap();
            assert!(!is_zombie(second_pid));
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
        async fn test_undesired_stream_leaves_registry() {
            let manager = manager();
            let mut events = manager.subscribe();
            let (tx, _rx) = mpsc::channel(64);
            let src = SourceDescriptor::new("rtsp://cam/1", Transport::Tcp);
            let instance = manager.start(src.clone(), tx).await.unwrap();
            let started = next_of(&mut events, EventKind::ProcessStarted).await;

            manager.desired.remove(src.id());
            let ev = removed(&mut events, instance).await;
            assert_eq!(ev.reason.as_deref(), Some("no_longer_desired"));
            assert!(manager.active_streams().await.is_empty());
            assert!(!is_zombie(started.pid.unwrap()));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_racing_stop_and_start_keep_entry_desired() {
            let manager = manager();
            let (tx, _rx) = mpsc::channel(64);
            let src = SourceDescriptor::new("rtsp://cam/1", Transport::Tcp);
            manager.start(src.clone(), tx.clone()).await.unwrap();

            for _ in 0..25 {
                let stop = {
                    let manager = Arc::clone(&manager);
                    let id = src.id().to_string();
                    tokio::spawn(async move { manager.stop(&id).await })
                };
                let start = {
                    let manager = Arc::clone(&manager);
                    let (src, tx) = (src.clone(), tx.clone());
                    tokio::spawn(async move { manager.start(src, tx).await })
                };
                let _ = stop.await.unwrap();
                let _ = start.await.unwrap();

                let registered = manager.active_streams().await.contains(&src.id().to_string());
                assert_eq!(registered, manager.desired.contains(src.id()));
            }

            if !manager.active_streams().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let health = manager.health_check().await;
                assert!(health["rtsp://cam/1"].pid.is_some());
            }
            manager.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_monitor_restarts_silent_stream() {
            let mut cfg = config();
            cfg.monitor_interval = Duration::from_millis(200);
            cfg.stream.healthy_threshold = Duration::from_millis(300);
            cfg.stream.output_grace_period = Duration::from_millis(100);
            cfg.stream.silence_timeout = Duration::from_secs(30);
            let manager = SupervisorManager::builder(cfg)
                .with_decoder(Arc::new(ShellCommand("sleep 30")))
                .build();
            let mut events = manager.subscribe();
            let (tx, _rx) = mpsc::channel(8);
            manager
                .start(SourceDescriptor::new("rtsp://cam/1", Transport::Tcp), tx)
                .await
                .unwrap();

            let first = next_of(&mut events, EventKind::ProcessStarted).await;
            let request = next_of(&mut events, EventKind::RestartRequested).await;
            assert_eq!(request.reason.as_deref(), Some("automatic"));
            let second = next_of(&mut events, EventKind::ProcessStarted).await;
            assert_ne!(first.pid, second.pid);
            assert!(!is_zombie(first.pid.unwrap()));

            manager.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_shutdown_reports_stuck_stream_and_still_cleans_up() {
            let mut cfg = config();
            cfg.grace = Duration::from_millis(300);
            cfg.stream.cleanup_timeout = Duration::from_secs(2);
            cfg.stream.reap_timeout = Duration::from_secs(1);
            let manager = SupervisorManager::builder(cfg)
                .with_decoder(Arc::new(ShellCommand(
                    "trap '' TERM; while :; do sleep 0.1; done",
                )))
                .build();
            let mut events = manager.subscribe();
            let (tx, _rx) = mpsc::channel(8);
            manager
                .start(SourceDescriptor::new("rtsp://admin:pw@cam/1", Transport::Tcp), tx)
                .await
                .unwrap();
            let pid = next_of(&mut events, EventKind::ProcessStarted)
                .await
                .pid
                .unwrap();

            match manager.shutdown().await {
                Err(ManagerError::GraceExceeded { grace, stuck }) => {
                    assert_eq!(grace, Duration::from_millis(300));
                    assert_eq!(stuck, vec!["rtsp://cam/1".to_string()]);
                }
                other => panic!("expected grace exceeded, got {other:?}"),
            }
            let ev = next_of(&mut events, EventKind::GraceExceeded).await;
            assert_eq!(ev.reason.as_deref(), Some("rtsp://cam/1"));

            tokio::time::sleep(Duration::from_millis(3_500)).await;
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }
}
