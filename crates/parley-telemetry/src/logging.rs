use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub user_id: Option<String>,
    pub conn_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub user_id: Option<String>,
    pub conn_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 user_id TEXT,
                 conn_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        // A failed log write has nowhere to be reported.
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, user_id, conn_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.correlation.user_id,
                record.correlation.conn_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, user_id, conn_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut filter = |clause: &str, value: String| {
            sql.push_str(&format!(" AND {clause} ?{}", params.len() + 1));
            params.push(Box::new(value));
        };

        if let Some(level) = &q.level {
            filter("level =", level.clone());
        }
        if let Some(target) = &q.target {
            filter("target LIKE", format!("%{target}%"));
        }
        if let Some(user_id) = &q.user_id {
            filter("user_id =", user_id.clone());
        }
        if let Some(conn_id) = &q.conn_id {
            filter("conn_id =", conn_id.clone());
        }
        if let Some(since) = &q.since {
            filter("timestamp >=", since.clone());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                user_id: row.get(7)?,
                conn_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    correlation: Correlation,
}

/// Connection identity lifted from event or span fields.
#[derive(Clone, Debug, Default)]
struct Correlation {
    user_id: Option<String>,
    conn_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.conn_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.user_id.is_some() && self.conn_id.is_some()
    }

    fn fill_from(&mut self, other: &Correlation) {
        if self.user_id.is_none() {
            self.user_id.clone_from(&other.user_id);
        }
        if self.conn_id.is_none() {
            self.conn_id.clone_from(&other.conn_id);
        }
    }
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: Correlation,
}

impl FieldVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "user_id" => self.correlation.user_id = Some(value),
            "conn_id" => self.correlation.conn_id = Some(value),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "user_id" | "conn_id" => text.trim_matches('"').to_string(),
            _ => text,
        };
        self.record_text(field, text);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut span_id = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if span_id.is_none() {
                    span_id = Some(format!("{:?}", span.id()));
                }
                if visitor.correlation.is_complete() {
                    continue;
                }
                if let Some(inherited) = span.extensions().get::<Correlation>() {
                    visitor.correlation.fill_from(inherited);
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            span_id,
            correlation: visitor.correlation,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.correlation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("parley-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("logs.db")
    }

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, target: &str, message: &str, user: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            span_id: None,
            correlation: Correlation {
                user_id: user.map(str::to_string),
                conn_id: None,
            },
        });
    }

    #[test]
    fn filters_by_level_target_and_user() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert(&sink, "2026-03-01T12:00:00Z", "WARN", "parley_server::hub", "evicted", Some("u1"));
        insert(&sink, "2026-03-01T12:00:01Z", "ERROR", "parley_store::messages", "disk full", None);
        insert(&sink, "2026-03-01T12:00:02Z", "WARN", "parley_server::client", "write failed", Some("u2"));
        assert_eq!(sink.count().unwrap(), 3);

        let errors = sink
            .query(&LogQuery { level: Some("ERROR".into()), ..Default::default() })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "disk full");

        let hub = sink
            .query(&LogQuery { target: Some("hub".into()), ..Default::default() })
            .unwrap();
        assert_eq!(hub.len(), 1);

        let u2 = sink
            .query(&LogQuery { user_id: Some("u2".into()), ..Default::default() })
            .unwrap();
        assert_eq!(u2.len(), 1);
        assert_eq!(u2[0].message, "write failed");
    }

    #[test]
    fn since_and_limit() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            insert(&sink, &format!("2026-03-01T12:00:{i:02}Z"), "WARN", "test", &format!("msg {i}"), None);
        }

        let recent = sink.query(&LogQuery { limit: Some(3), ..Default::default() }).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "msg 9");

        let since = sink
            .query(&LogQuery { since: Some("2026-03-01T12:00:08Z".into()), ..Default::default() })
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn layer_persists_warn_with_span_correlation() {
        let sink = Arc::new(SqliteLogSink::new(&temp_db()).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("connection", user_id = "u1", conn_id = "conn_1");
            let _entered = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(queued = 256u64, "outbound queue full");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message, "outbound queue full");
        assert_eq!(record.user_id.as_deref(), Some("u1"));
        assert_eq!(record.conn_id.as_deref(), Some("conn_1"));
        assert_eq!(record.fields.as_deref(), Some(r#"{"queued":256}"#));
        assert!(record.span_id.is_some());
    }

    #[test]
    fn event_fields_win_over_span_fields() {
        let sink = Arc::new(SqliteLogSink::new(&temp_db()).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("hub", user_id = "u1");
            let _entered = span.enter();
            tracing::error!(user_id = %"u9", "persist failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records[0].user_id.as_deref(), Some("u9"));
        assert!(records[0].conn_id.is_none());
    }
}
