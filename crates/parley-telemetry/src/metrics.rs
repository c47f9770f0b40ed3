use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

const SNAPSHOT_DDL: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     CREATE TABLE IF NOT EXISTS metrics_snapshots (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         timestamp TEXT NOT NULL,
         name TEXT NOT NULL,
         value REAL NOT NULL,
         labels TEXT,
         metric_type TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "gauge" => Self::Gauge,
            "histogram" => Self::Histogram,
            _ => Self::Counter,
        }
    }
}

/// A persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

/// A live metric value, as exposed over HTTP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Observations kept for percentiles. Count and sum cover all of them.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Default)]
struct Histogram {
    state: Mutex<HistogramState>,
}

#[derive(Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    recent: VecDeque<f64>,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut state = self.state.lock();
        state.count += 1;
        state.sum += value;
        if state.recent.len() == HISTOGRAM_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let (count, sum, mut recent) = {
            let state = self.state.lock();
            (state.count, state.sum, Vec::from_iter(state.recent.iter().copied()))
        };
        if recent.is_empty() {
            return HistogramSummary::default();
        }
        recent.sort_by(|a, b| a.total_cmp(b));
        let len = recent.len();
        let at = |q: f64| recent[((len as f64 * q) as usize).min(len - 1)];
        HistogramSummary {
            count,
            sum,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Map of metric instruments, created on first use.
struct Family<M> {
    inner: RwLock<HashMap<MetricKey, M>>,
}

impl<M: Default> Family<M> {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn with(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&M)) {
        let key = MetricKey::new(name, labels);
        if let Some(m) = self.inner.read().get(&key) {
            f(m);
            return;
        }
        f(self.inner.write().entry(key).or_default());
    }

    fn read<T>(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&M) -> T) -> Option<T> {
        self.inner.read().get(&MetricKey::new(name, labels)).map(f)
    }

    fn collect<T>(&self, mut f: impl FnMut(&MetricKey, &M) -> T) -> Vec<T> {
        self.inner.read().iter().map(|(k, m)| f(k, m)).collect()
    }
}

/// Thread-safe metrics recorder backed by SQLite for historical snapshots.
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Recorder whose snapshots live only as long as the process.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SNAPSHOT_DDL)?;
        Ok(Self {
            counters: Family::new(),
            gauges: Family::new(),
            histograms: Family::new(),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(name, labels, |c| c.increment(n));
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.with(name, labels, |g| g.set(value));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.with(name, labels, |h| h.observe(value));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters.read(name, labels, Counter::get).unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges.read(name, labels, Gauge::get).unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read(name, labels, Histogram::summary)
            .unwrap_or_default()
    }

    /// Every live metric, sorted by name then labels. Histograms report p50.
    pub fn current(&self) -> Vec<MetricValue> {
        let value = |key: &MetricKey, value: f64, metric_type| MetricValue {
            name: key.name.clone(),
            labels: key.labels.clone(),
            value,
            metric_type,
        };
        let mut all = self
            .counters
            .collect(|k, c| value(k, c.get() as f64, MetricType::Counter));
        all.extend(self.gauges.collect(|k, g| value(k, g.get(), MetricType::Gauge)));
        all.extend(
            self.histograms
                .collect(|k, h| value(k, h.summary().p50, MetricType::Histogram)),
        );
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        all
    }

    /// Persist every current value as one snapshot row. Returns rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(MetricKey, f64, MetricType)> = self
            .counters
            .collect(|k, c| (k.clone(), c.get() as f64, MetricType::Counter));
        rows.extend(self.gauges.collect(|k, g| (k.clone(), g.get(), MetricType::Gauge)));
        rows.extend(
            self.histograms
                .collect(|k, h| (k.clone(), h.summary().p50, MetricType::Histogram)),
        );

        let db = self.db.lock();
        let mut stmt = db.prepare(
            "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (key, value, metric_type) in &rows {
            stmt.execute(rusqlite::params![
                now,
                key.name,
                value,
                key.labels_json(),
                metric_type.as_str()
            ])?;
        }
        Ok(rows.len())
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let metric_type: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: MetricType::parse(&metric_type),
            })
        })?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp <= ?1",
            rusqlite::params![cutoff],
        )
    }
}
