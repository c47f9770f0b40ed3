//! # parley
//!
//! Chat hub binary: resolves configuration, opens the database and serves
//! WebSocket and HTTP clients until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parley_server::{load_config, ServerConfig};
use parley_store::{Database, SqliteChatStore};
use parley_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Presence-aware chat hub.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Presence-aware chat hub")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the chat database.
    #[arg(long, env = "PARLEY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Persist warn+ logs to this SQLite file.
    #[arg(long)]
    log_db_path: Option<PathBuf>,

    /// Emit JSON log lines instead of human-readable output.
    #[arg(long)]
    json_logs: bool,

    /// Default log level. `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }

    fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| data_dir().join("parley.db"))
    }

    fn telemetry(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: self.log_level,
            json_logs: self.json_logs,
            log_to_sqlite: self.log_db_path.is_some(),
            log_db_path: self.log_db_path.clone().unwrap_or(defaults.log_db_path.clone()),
            ..defaults
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Periodically persist metric snapshots and drop old ones.
fn spawn_metrics_snapshots(
    metrics: Arc<MetricsRecorder>,
    every: Duration,
    retention_days: u32,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = metrics.snapshot() {
                        warn!(error = %e, "metrics snapshot failed");
                    }
                    match metrics.prune(retention_days) {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "pruned old metric snapshots"),
                        Err(e) => warn!(error = %e, "metrics prune failed"),
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry_config = cli.telemetry();
    if let Some(path) = &telemetry_config.metrics_db_path {
        ensure_parent_dir(path)?;
    }
    if telemetry_config.log_to_sqlite {
        ensure_parent_dir(&telemetry_config.log_db_path)?;
    }
    let snapshot_every = Duration::from_secs(telemetry_config.metrics_snapshot_interval_secs);
    let retention_days = telemetry_config.metrics_retention_days;
    let telemetry = init_telemetry(telemetry_config);

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let db_path = cli.db_path();
    ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database: {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    let online_window = i64::try_from(config.online_window_secs).unwrap_or(i64::MAX);
    let store = SqliteChatStore::new(db)
        .with_online_window(chrono::Duration::seconds(online_window));

    let metrics = telemetry.metrics();
    let handle = parley_server::start(config, Arc::new(store), metrics.clone())
        .await
        .context("failed to start server")?;
    info!(addr = %handle.addr(), "parley ready");

    let snapshots = CancellationToken::new();
    let snapshot_task = metrics.map(|m| {
        spawn_metrics_snapshots(m, snapshot_every, retention_days, snapshots.clone())
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");

    handle.shutdown().await;
    snapshots.cancel();
    if let Some(task) = snapshot_task {
        let _ = task.await;
    }
    if let Some(m) = telemetry.metrics() {
        if let Err(e) = m.snapshot() {
            warn!(error = %e, "final metrics snapshot failed");
        }
    }
    Ok(())
}
