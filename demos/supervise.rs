//! # Demo: supervise
//!
//! Supervises one or more RTSP sources with ffmpeg until Ctrl-C / SIGTERM.
//!
//! Demonstrates how to:
//! - Build a `SupervisorManager` and converge it on a source list with `reconcile`.
//! - Consume per-chunk `AudioEvent`s from the shared output channel.
//! - Follow supervision events on the bus and poll `health_check`.
//! - Shut down with a bounded grace period.
//!
//! ## Flow
//! ```text
//! main()
//!   ├─► reconcile([sources]) ─► one StreamSupervisor per source
//!   ├─► spawn audio consumer   (output channel)
//!   ├─► spawn event logger     (bus)
//!   ├─► spawn health printer   (every 10s)
//!   └─► run_until_signal()     ─► shutdown(grace)
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=streamvisor=debug cargo run --example supervise -- rtsp://10.0.0.5/live udp:rtsp://10.0.0.6/live
//! ```
//! A `udp:` prefix selects the UDP transport; TCP is the default.

use std::time::Duration;

use streamvisor::{ManagerConfig, SourceConfig, SupervisorManager, Transport};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

fn parse_source(arg: &str) -> anyhow::Result<SourceConfig> {
    match arg.split_once(':') {
        Some((prefix, url)) if !prefix.contains('/') && url.contains("://") => {
            let transport: Transport = prefix.parse()?;
            Ok(SourceConfig::new(url, transport))
        }
        _ => Ok(SourceConfig::new(arg, Transport::Tcp)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamvisor=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let sources = std::env::args()
        .skip(1)
        .map(|a| parse_source(&a))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if sources.is_empty() {
        anyhow::bail!("usage: supervise [transport:]<url>...");
    }

    let mut cfg = ManagerConfig::default();
    cfg.grace = Duration::from_secs(5);
    cfg.stream.backoff.jitter = streamvisor::JitterPolicy::Proportional { max_percent: 20 };

    let manager = SupervisorManager::builder(cfg).build();
    let (tx, mut rx) = mpsc::channel::<streamvisor::AudioEvent>(256);

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => tracing::debug!(
                    kind = ?ev.kind,
                    source = ev.source.as_deref().unwrap_or("-"),
                    reason = ev.reason.as_deref().unwrap_or(""),
                    "event"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event logger lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        let mut chunks: u64 = 0;
        while let Some(ev) = rx.recv().await {
            chunks += 1;
            if chunks % 500 == 0 {
                tracing::info!(source = %ev.source, level = ev.level.level, clipping = ev.level.clipping, "audio");
            }
        }
    });

    let report = manager.reconcile(&sources, &tx).await;
    tracing::info!(started = ?report.started, "sources started");

    let monitor = manager.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.tick().await;
        loop {
            tick.tick().await;
            for h in monitor.health_check().await.into_values() {
                tracing::info!(
                    source = %h.source,
                    state = %h.state,
                    healthy = h.is_healthy,
                    bytes = h.total_bytes,
                    bytes_per_sec = h.bytes_per_sec,
                    restarts = h.restart_count,
                    dropped = h.dropped_events,
                    "health"
                );
            }
        }
    });

    manager.run_until_signal().await?;
    Ok(())
}
