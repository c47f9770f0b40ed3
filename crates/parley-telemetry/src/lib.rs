mod logging;
mod metrics;
pub mod names;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{
    HistogramSummary, MetricType, MetricValue, MetricsQuery, MetricsRecorder, MetricsSnapshot,
};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_server::hub" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout instead of human-readable output.
    pub json_logs: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    /// Snapshot database. `None` keeps snapshots in memory.
    pub metrics_db_path: Option<PathBuf>,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let data_dir = data_dir_fallback();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_logs: true,
            log_to_sqlite: false,
            log_db_path: data_dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: Some(data_dir.join("metrics.db")),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Keeps the log sink and metrics recorder alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// Shared handle to the metrics recorder, if enabled.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter(&config))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter(&config))
            .boxed()
    };

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("parley-telemetry: subscriber already installed: {e}");
    }

    let metrics_recorder = if config.metrics_enabled {
        let recorder = match &config.metrics_db_path {
            Some(path) => MetricsRecorder::new(path),
            None => MetricsRecorder::in_memory(),
        };
        match recorder {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB, metrics disabled");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink,
        metrics_recorder,
    }
}

fn data_dir_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_metrics_on_and_sqlite_logs_off() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.metrics_enabled);
        assert!(!config.log_to_sqlite);
        assert!(config
            .metrics_db_path
            .as_ref()
            .is_some_and(|p| p.ends_with(".parley/metrics.db")));
    }

    #[test]
    fn init_with_in_memory_metrics() {
        let guard = init_telemetry(TelemetryConfig {
            json_logs: false,
            metrics_db_path: None,
            ..Default::default()
        });
        let metrics = guard.metrics().unwrap();
        metrics.counter_inc(names::CONNECTIONS_TOTAL, &[], 1);
        assert_eq!(metrics.counter_get(names::CONNECTIONS_TOTAL, &[]), 1);
        assert!(guard.logs().is_none());
    }
}
