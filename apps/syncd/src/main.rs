//! # Tally Sync Daemon
//!
//! Headless runner for one device: keeps the local database synced with the
//! cloud store and takes scheduled backups until interrupted.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Daemon Startup                                  │
//! │                                                                         │
//! │  1. Logging        RUST_LOG, default "info,tally=debug,sqlx=warn"       │
//! │  2. Config         sync.toml (or argv[1]) + TALLY_* overrides           │
//! │  3. Database       SQLite file, migrations applied                      │
//! │  4. Network        TCP probe, polled in the background                  │
//! │  5. Cloud          HTTP backend, authenticated when a token is set      │
//! │  6. Sync           engine built, file settings applied, first cycle run │
//! │  7. Backups        automatic schedule when configured                   │
//! │  8. Ctrl+C / TERM  stop schedules, close the pool                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally_core::SyncState;
use tally_db::{Database, DbConfig};
use tally_sync::{
    BackupEngine, CloudStorage, EngineOptions, HttpBackend, NetworkMonitor, StaticAccess,
    SyncEngine, SyncEventEmitter, TallyConfig, TcpProbe,
};

/// Forwards engine events to the log.
struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_status(&self, state: SyncState) {
        info!(%state, "Sync status");
    }

    fn emit_progress(&self, pending: i64, synced: i64) {
        info!(pending, synced, "Sync progress");
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        warn!(retryable, "Sync error: {}", message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting Tally sync daemon");

    let config = TallyConfig::load_or_default(std::env::args().nth(1).map(PathBuf::from));

    let db_path = config
        .database_path()
        .context("no database path configured and no platform data directory")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&db_path)).await?;
    info!(?db_path, "Database connected and migrations applied");

    let network = Arc::new(NetworkMonitor::new(TcpProbe::new(
        config.network.probe_host.clone(),
        config.probe_timeout(),
    )));
    network.refresh().await;
    let polling = network.spawn_polling(config.poll_interval());

    let backend = HttpBackend::new(&config.cloud.endpoint, config.request_timeout())?;
    let cloud = Arc::new(CloudStorage::new(Arc::new(backend), Arc::clone(&network)));
    match &config.cloud.token {
        Some(token) => match cloud.authenticate(token, Some(&config.cloud.endpoint)).await {
            Ok(true) => info!("Authenticated with cloud store"),
            Ok(false) => warn!("Cloud store rejected the token, running local-only"),
            Err(e) => warn!(%e, "Cloud authentication failed, running local-only"),
        },
        None => info!("No cloud token configured, running local-only"),
    }

    // The builder fills in the device id, which may not be known yet.
    let mut builder = SyncEngine::builder(db.clone(), cloud)
        .emitter(Arc::new(LogEmitter))
        .options(EngineOptions {
            batch_size: config.sync.batch_size,
            upload_max_retries: config.sync.upload_max_retries,
            upload_base_delay: config.upload_base_delay(),
        })
        .seed_config(config.seed_sync_config(""));
    if let Some(id) = &config.device.id {
        builder = builder.device_id(id.clone());
    }
    let engine = builder.build().await?;
    engine.update_config(config.sync_config_update()).await?;
    info!(device_id = %engine.device_id(), name = %config.device.name, "Device ready");

    match engine.start_sync().await {
        Ok(report) => info!(outcome = ?report.outcome, "Initial sync finished"),
        Err(e) => error!(?e, "Initial sync failed"),
    }

    let backups = Arc::new(BackupEngine::new(
        db.clone(),
        Arc::clone(engine.store()),
        Arc::new(StaticAccess::admin("syncd")),
        engine.device_id(),
        config.backup.max_backups,
    ));
    if let Some(interval) = config.backup.auto_interval {
        backups.schedule_automatic_backup(interval).await;
    }

    shutdown_signal().await;

    engine.stop_sync().await;
    backups.cancel_automatic_backup().await;
    polling.stop().await;
    db.close().await;

    info!("Sync daemon stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_sync=trace` - Trace the engines only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
