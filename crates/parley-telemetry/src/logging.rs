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

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        channel_id TEXT,
        connection_id TEXT,
        user_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_channel ON logs(channel_id);
    CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);";

/// A warn+ log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub channel_id: Option<String>,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub channel_id: Option<String>,
    pub connection_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// IDs promoted from event/span fields into their own columns so logs can
/// be filtered per channel or per connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Correlation {
    channel_id: Option<String>,
    connection_id: Option<String>,
    user_id: Option<String>,
}

impl Correlation {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "channel_id" => Some(&mut self.channel_id),
            "connection_id" => Some(&mut self.connection_id),
            "user_id" => Some(&mut self.user_id),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.channel_id.is_none() && self.connection_id.is_none() && self.user_id.is_none()
    }

    fn fill_from(&mut self, outer: &Correlation) {
        if self.channel_id.is_none() {
            self.channel_id.clone_from(&outer.channel_id);
        }
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&outer.connection_id);
        }
        if self.user_id.is_none() {
            self.user_id.clone_from(&outer.user_id);
        }
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    correlation: Correlation,
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
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // Logging must never fail the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, channel_id, connection_id, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.correlation.channel_id,
                record.correlation.connection_id,
                record.correlation.user_id,
            ],
        );
    }

    /// Most recent records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, channel_id, connection_id, user_id
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        let filters = [
            ("level = ", &q.level),
            ("channel_id = ", &q.channel_id),
            ("connection_id = ", &q.connection_id),
            ("timestamp >= ", &q.since),
        ];
        for (clause, value) in filters {
            if let Some(value) = value {
                params.push(value.clone());
                sql.push_str(&format!(" AND {clause}?{}", params.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                channel_id: row.get(6)?,
                connection_id: row.get(7)?,
                user_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: Correlation,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            correlation: Correlation::default(),
        }
    }

    fn record_string(&mut self, name: &str, value: String) {
        if name == "message" {
            self.message = Some(value);
        } else if let Some(slot) = self.correlation.slot(name) {
            *slot = Some(value);
        } else {
            self.fields.insert(name.to_string(), serde_json::Value::String(value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        self.record_string(field.name(), val.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_string(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
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

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // Inherit IDs from enclosing spans, innermost first
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    visitor.correlation.fill_from(outer);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            correlation: visitor.correlation,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if !visitor.correlation.is_empty() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(visitor.correlation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn insert(sink: &SqliteLogSink, level: &str, message: &str, channel: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "parley_engine::session".into(),
            message: message.into(),
            fields: None,
            correlation: Correlation {
                channel_id: channel.map(str::to_string),
                ..Default::default()
            },
        });
    }

    #[test]
    fn query_by_level_and_channel() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "WARN", "publish failed", Some("C1"));
        insert(&sink, "ERROR", "save failed", Some("C2"));

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "save failed");

        let c1 = sink
            .query(&LogQuery {
                channel_id: Some("C1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].message, "publish failed");
    }

    #[test]
    fn query_limit_returns_newest_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            insert(&sink, "WARN", &format!("msg {i}"), None);
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
        assert_eq!(sink.count().unwrap(), 10);
    }

    #[test]
    fn layer_persists_warnings_with_span_ids() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("connection", connection_id = "conn_1", user_id = "U1");
            let _enter = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(channel_id = "C1", attempt = 2u64, "publish failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.level, "WARN");
        assert_eq!(rec.message, "publish failed");
        assert_eq!(rec.channel_id.as_deref(), Some("C1"));
        assert_eq!(rec.connection_id.as_deref(), Some("conn_1"));
        assert_eq!(rec.user_id.as_deref(), Some("U1"));
        assert!(rec.fields.as_deref().unwrap_or("").contains("attempt"));
    }
}
