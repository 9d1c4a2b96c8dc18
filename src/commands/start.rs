//! `code-switch-relay start`: load configuration, open the SQLite pool
//! and provider store, wire the dispatcher/blacklist/availability-
//! monitor/request-log-queue/retention-sweep together, and serve.
//!
//! Grounded on the teacher's `server.rs` bootstrap shape (build one
//! shared `reqwest::Client`/`Arc<Config>`, construct the router, then
//! `axum::serve` with a graceful-shutdown future fed by
//! `signals.rs`'s broadcast channel) and `daemon.rs`/`pid.rs` for the
//! `--daemon`/`--pid-file` flags.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use relay_gateway::availability::AvailabilityMonitor;
use relay_gateway::blacklist::Blacklist;
use relay_gateway::config::{self, Config};
use relay_gateway::dispatcher::{self, DispatcherState};
use relay_gateway::http_client::HttpClientCell;
use relay_gateway::provider_store::ProviderStore;
use relay_gateway::request_log::RequestLogQueue;
use relay_gateway::signals;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

const DEFAULT_LOG_QUEUE_CAPACITY: usize = 10_000;
const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn execute(config_path: &str, daemon: bool, pid_file: Option<PathBuf>) -> Result<()> {
    if daemon {
        crate::daemon::daemonize(crate::daemon::DaemonConfig::default())
            .context("failed to daemonize")?;
        relay_gateway::init_tracing();
    }

    let cfg = config::load_config(config_path).context("failed to load configuration")?;
    std::fs::create_dir_all(&cfg.data_dir.root).context("failed to create data directory")?;
    std::fs::create_dir_all(cfg.data_dir.providers_dir())?;
    std::fs::create_dir_all(cfg.data_dir.proxy_state_dir())?;

    let _pid_file = crate::pid::PidFile::create(pid_file).context("failed to acquire PID file lock")?;

    let db_url = format!("sqlite://{}?mode=rwc", cfg.data_dir.database_path().display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("failed to open SQLite database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let config_cell = Arc::new(ArcSwap::from_pointee(cfg.clone()));
    let http_client = Arc::new(HttpClientCell::new(&cfg.http_proxy).context("failed to build HTTP client")?);
    let provider_store = Arc::new(ProviderStore::open(cfg.data_dir.providers_dir()));
    let blacklist = Arc::new(Blacklist::new(pool.clone()));
    let request_log = Arc::new(RequestLogQueue::new(DEFAULT_LOG_QUEUE_CAPACITY));

    let log_writer_stop = Arc::new(Notify::new());
    let log_writer = relay_gateway::request_log::spawn_writer(
        request_log.clone(),
        pool.clone(),
        LOG_FLUSH_INTERVAL,
        log_writer_stop.clone(),
    );

    let monitor = Arc::new(AvailabilityMonitor::new(
        pool.clone(),
        provider_store.clone(),
        blacklist.clone(),
        http_client.clone(),
    ));
    let monitor_handle = monitor.clone().start_background_polling(
        Duration::from_secs(cfg.availability.poll_interval_seconds),
        Duration::from_millis(cfg.availability.operational_threshold_ms),
        Duration::from_secs(cfg.availability.probe_timeout_seconds),
        cfg.availability.max_concurrent_probes,
        relay_gateway::availability::BlacklistFeedConfig {
            failure_threshold: cfg.blacklist.failure_threshold,
            duration_minutes: cfg.blacklist.duration_minutes,
        },
    );

    let retention_stop = Arc::new(Notify::new());
    let retention_handle = relay_gateway::retention::spawn(pool.clone(), cfg.retention.days_to_keep, retention_stop.clone());

    let state = DispatcherState {
        config: config_cell.clone(),
        provider_store,
        blacklist,
        http_client: http_client.clone(),
        request_log: request_log.clone(),
    };
    let app = dispatcher::build_router(state);

    let (shutdown_tx, _signal_handle) = signals::setup_signal_handlers(
        config_path.to_string(),
        config_cell,
        http_client,
    );
    let mut shutdown_rx = shutdown_tx.subscribe();

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    monitor.stop_background_polling();
    retention_stop.notify_waiters();
    log_writer_stop.notify_waiters();
    let _ = monitor_handle.await;
    let _ = retention_handle.await;
    let _ = log_writer.await;

    Ok(())
}
