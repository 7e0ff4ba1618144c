//! Orchestrator: owns the buffer, the upload pump, the per-asset
//! collector tasks, and the health/maintenance loop, all under one
//! cancellation token. Components are constructed here and handed in by
//! reference; there are no process-wide singletons.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::{BufferError, DurableBuffer};
use crate::config::BridgeConfig;
use crate::sinks::influxdb::client::{InfluxSink, SinkError};
use crate::sinks::influxdb::UploadPump;
use crate::sources::opcua::transport::{FieldConnector, IdentityProvider};
use crate::sources::opcua::{AssetCollector, CollectorHealth, CollectorSettings, SessionState};

/// How long tasks get to wind down after cancellation before being
/// abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const HEALTH_INTERVAL: Duration = Duration::from_secs(300);
const COMPACTION_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("Buffer startup failed: {source}"))]
    BufferStartup { source: BufferError },
    #[snafu(display("Remote store unreachable at startup: {source}"))]
    StartupPing { source: SinkError },
}

/// Runs the bridge until SIGINT/SIGTERM. Fatal startup failures
/// propagate; everything after startup is recovered or degraded in place.
pub async fn run(
    config: BridgeConfig,
    connector: Arc<dyn FieldConnector>,
    identity: Arc<dyn IdentityProvider>,
    sink: Arc<dyn InfluxSink>,
) -> Result<(), AppError> {
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    run_with_shutdown(config, connector, identity, sink, shutdown).await
}

/// Same as [`run`] with an externally owned cancellation token; the
/// integration tests drive shutdown through this.
pub async fn run_with_shutdown(
    config: BridgeConfig,
    connector: Arc<dyn FieldConnector>,
    identity: Arc<dyn IdentityProvider>,
    sink: Arc<dyn InfluxSink>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let globals = &config.global_settings;
    let buffer = DurableBuffer::open(&globals.buffer.path, globals.buffer.max_size_mb)
        .await
        .context(BufferStartupSnafu)?;

    // Reachability is verified before any task spawns; a dead remote
    // store at startup is fatal.
    sink.ping().await.context(StartupPingSnafu)?;
    info!(
        message = "Connected to remote store.",
        enterprise = %config.enterprise_name
    );

    let health = Arc::new(CollectorHealth::default());
    let collector_settings = CollectorSettings::from_config(globals);
    let mut tasks = JoinSet::new();

    let mut asset_count = 0usize;
    for site in &config.sites {
        for asset in &site.assets {
            let collector = AssetCollector::new(
                asset.clone(),
                site,
                Arc::clone(&connector),
                Arc::clone(&identity),
                buffer.clone(),
                collector_settings.clone(),
                Arc::clone(&health),
            );
            tasks.spawn(collector.run(shutdown.clone()));
            asset_count += 1;
        }
    }

    let pump = UploadPump::new(buffer.clone(), Arc::clone(&sink), globals.upload.clone());
    tasks.spawn(pump.run(shutdown.clone()));
    tasks.spawn(health_loop(
        buffer.clone(),
        Arc::clone(&sink),
        Arc::clone(&health),
        shutdown.clone(),
    ));

    info!(
        message = "Bridge started.",
        assets = asset_count,
        sites = config.sites.len()
    );

    shutdown.cancelled().await;
    info!(message = "Shutting down; waiting for tasks.");

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(result)) => {
                if let Err(join_error) = result {
                    if !join_error.is_cancelled() {
                        error!(message = "Task ended abnormally.", %join_error);
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    message = "Shutdown grace elapsed; abandoning remaining tasks.",
                    remaining = tasks.len()
                );
                tasks.abort_all();
                break;
            }
        }
    }

    info!(message = "Bridge stopped.");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    error!(message = "Unable to install SIGTERM handler.", %error);
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!(message = "SIGINT received."),
                _ = sigterm.recv() => info!(message = "SIGTERM received."),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!(message = "Interrupt received.");
        }
        shutdown.cancel();
    });
}

/// Coarse-timer health and maintenance: session states, buffer and sink
/// probes, and compaction of old processed rows.
async fn health_loop(
    buffer: DurableBuffer,
    sink: Arc<dyn InfluxSink>,
    health: Arc<CollectorHealth>,
    shutdown: CancellationToken,
) {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + HEALTH_INTERVAL, HEALTH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let connected = health.count(SessionState::Connected);
        let reconnecting =
            health.count(SessionState::Connecting) + health.count(SessionState::Backoff);
        let quarantined = health.count(SessionState::Quarantined);
        let sink_reachable = sink.ping().await.is_ok();

        match buffer.delete_processed_older_than(COMPACTION_HORIZON_HOURS).await {
            Ok(removed) if removed > 0 => {
                info!(message = "Compacted old processed rows.", rows = removed);
            }
            Ok(_) => {}
            Err(error) => error!(message = "Buffer compaction failed.", %error),
        }

        match buffer.status().await {
            Ok(status) => {
                gauge!("buffer_bytes_used").set(status.bytes_used as f64);
                gauge!("buffer_unprocessed_samples").set(status.sample_unprocessed as f64);
                let degraded = quarantined > 0 || !sink_reachable;
                if degraded {
                    warn!(
                        message = "Health rollup: degraded.",
                        connected,
                        reconnecting,
                        quarantined,
                        sink_reachable,
                        buffer_bytes_used = status.bytes_used,
                        buffer_samples = status.sample_count,
                        buffer_analytics = status.analytics_count
                    );
                } else {
                    info!(
                        message = "Health rollup.",
                        connected,
                        reconnecting,
                        quarantined,
                        sink_reachable,
                        buffer_bytes_used = status.bytes_used,
                        buffer_samples = status.sample_count,
                        buffer_analytics = status.analytics_count
                    );
                }
            }
            Err(error) => error!(message = "Buffer status probe failed.", %error),
        }
    }
}
