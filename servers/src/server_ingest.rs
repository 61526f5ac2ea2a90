//! # Telemetry Ingestion Server
//!
//! Subscribes to device telemetry on the MQTT broker, normalizes and persists
//! every message on a dedicated worker thread, and pushes recognition and
//! violation events to dashboard clients over websockets. Report searches are
//! served over HTTP from a second worker thread so they never compete with
//! ingestion.

use anyhow::Result;
use lib_common::connections::{MemoryStore, PgTelemetryStore, TelemetryStore};
use lib_common::pipeline::{
    BroadcastEnvelope, EventBus, ImageStorage, Normalizer, PushGateway, TaskDispatcher, spawn_normalizer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info, warn};

mod ingest_logic;
use ingest_logic::config::{self, Config};
use ingest_logic::state::AppState;
use ingest_logic::{downstream, logger, monitor, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    let (config, config_file) = config::load_config();
    let _log_guard = logger::setup_logging(config.log_dir(), config.log_level())?;
    config_file.log();
    info!(port = config.port(), "server_ingest starting");

    let (fatal_tx, fatal_rx) = oneshot::channel::<()>();
    let shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = fatal_rx => warn!("Server stopped without a shutdown signal"),
        }
    });

    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = run_server(config, guard).await {
            error!(error = ?e, "Server failed");
        }
        drop(fatal_tx);
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!(
            "shutdown: gracefully {}s after shutdown signal received",
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }

    info!("Bye!");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term_signal = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term_signal) => term_signal,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Ctrl-C received, initiating shutdown."),
            _ = term_signal.recv() => info!("SIGTERM received, initiating shutdown."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received, initiating shutdown.");
    }
}

struct Stores {
    settings: Arc<dyn TelemetryStore>,
    normalizer: Arc<dyn TelemetryStore>,
    query: Arc<dyn TelemetryStore>,
}

/// Each worker gets its own pool so pooled connections are driven by the
/// worker's runtime.
async fn build_stores(config: &Config) -> Result<Stores> {
    match config.database_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let pool_size = config.database_pool_size();
            let settings = PgTelemetryStore::new(url, pool_size)?;
            settings.ensure_schema().await?;
            info!(pool_size, "PostgreSQL store ready");
            Ok(Stores {
                settings: Arc::new(settings),
                normalizer: Arc::new(PgTelemetryStore::new(url, pool_size)?),
                query: Arc::new(PgTelemetryStore::new(url, pool_size)?),
            })
        }
        None => {
            warn!("No database URL configured, events are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                settings: store.clone(),
                normalizer: store.clone(),
                query: store,
            })
        }
    }
}

async fn run_server(config: Config, guard: ShutdownGuard) -> Result<()> {
    let stores = build_stores(&config).await?;
    let broker = upstream::resolve_broker(&config, stores.settings.as_ref()).await;

    let normalizer = Normalizer::new(
        stores.normalizer,
        ImageStorage::new(config.image_root()),
        config.case_assignee(),
    );
    let (normalizer, _normalizer_thread) = spawn_normalizer(normalizer, config.normalizer_queue_depth())?;

    let gateway = Arc::new(PushGateway::new());
    let bus = Arc::new(EventBus::<BroadcastEnvelope>::new());
    let gateway_subscription = gateway.attach(&bus);
    let dispatcher = Arc::new(TaskDispatcher::start(stores.query)?);

    let app_state = AppState::new(gateway.clone(), bus.clone(), dispatcher.clone(), normalizer.clone());
    monitor::register_tasks(&app_state);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (relay_tx, relay_rx) = mpsc::channel::<BroadcastEnvelope>(config.normalizer_queue_depth());

    let relay_handle = tokio::spawn(upstream::relay_to_bus(relay_rx, bus.clone()));
    let upstream_handle = tokio::spawn(upstream::run(broker, normalizer, relay_tx, shutdown_tx.subscribe()));
    let mut downstream_handle = tokio::spawn(downstream::run(
        config.port(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));
    let liveness_handle = tokio::spawn(
        gateway
            .clone()
            .run_liveness(config.liveness_interval(), shutdown_tx.subscribe()),
    );
    let monitor_handle = tokio::spawn(monitor::run(
        config.monitor_interval(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let mut downstream_result = None;
    tokio::select! {
        _ = guard.cancelled() => info!("Shutdown requested, stopping components"),
        result = &mut downstream_handle => downstream_result = Some(result),
    }

    let _ = shutdown_tx.send(());
    let downstream_result = match downstream_result {
        Some(result) => result,
        None => downstream_handle.await,
    };
    let _ = tokio::join!(upstream_handle, liveness_handle, monitor_handle);
    if relay_handle.await.is_err() {
        warn!("Relay task panicked");
    }

    bus.unsubscribe(&gateway_subscription);
    gateway.shutdown();
    dispatcher.shutdown().await;
    info!("Shutdown complete.");

    downstream_result?
}
