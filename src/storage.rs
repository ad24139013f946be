//! Append-only metric samples.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

/// Largest page `recent` will return.
pub const MAX_RECENT: usize = 5000;

/// A sample to be stored.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMetric {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub value: serde_json::Value,
}

impl NewMetric {
    pub fn now(session_id: &str, kind: &str, value: serde_json::Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            kind: kind.to_string(),
            value,
        }
    }
}

/// A stored sample, as returned to readers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: i64,
    pub session_id: String,
    /// RFC 3339, UTC.
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

pub trait MetricStore: Send {
    /// Append one sample and return its id.
    fn append(&mut self, sample: &NewMetric) -> Result<i64>;

    /// Newest first, at most `limit` (capped at [`MAX_RECENT`]).
    fn recent(&mut self, limit: usize, session_id: Option<&str>) -> Result<Vec<MetricSample>>;
}

/// Store shared between the loop (writer) and the API (reader).
pub type SharedStore = Arc<Mutex<dyn MetricStore>>;

pub fn shared<S: MetricStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Open a SQLite connection, honouring `file:` URIs (used for shared in-memory databases).
pub fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub struct SqliteMetricStore {
    conn: Connection,
}

impl SqliteMetricStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open metric store {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              ts TEXT NOT NULL,
              type TEXT NOT NULL,
              value_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, id);
            "#,
        )?;
        Ok(())
    }
}

impl MetricStore for SqliteMetricStore {
    fn append(&mut self, sample: &NewMetric) -> Result<i64> {
        let value_json = serde_json::to_string(&sample.value)?;
        self.conn.execute(
            "INSERT INTO events(session_id, ts, type, value_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                sample.session_id,
                format_ts(&sample.timestamp),
                sample.kind,
                value_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent(&mut self, limit: usize, session_id: Option<&str>) -> Result<Vec<MetricSample>> {
        let limit = limit.min(MAX_RECENT) as i64;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, session_id, ts, type, value_json FROM events
            WHERE (?1 IS NULL OR session_id = ?1)
            ORDER BY id DESC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![session_id, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let value_json: String = row.get(4)?;
            let value = serde_json::from_str(&value_json)
                .map_err(|e| anyhow!("corrupt metric row value: {}", e))?;
            out.push(MetricSample {
                id: row.get(0)?,
                session_id: row.get(1)?,
                ts: row.get(2)?,
                kind: row.get(3)?,
                value,
            });
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryMetricStore {
    samples: Vec<MetricSample>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl MetricStore for InMemoryMetricStore {
    fn append(&mut self, sample: &NewMetric) -> Result<i64> {
        let id = self.samples.len() as i64 + 1;
        self.samples.push(MetricSample {
            id,
            session_id: sample.session_id.clone(),
            ts: format_ts(&sample.timestamp),
            kind: sample.kind.clone(),
            value: sample.value.clone(),
        });
        Ok(id)
    }

    fn recent(&mut self, limit: usize, session_id: Option<&str>) -> Result<Vec<MetricSample>> {
        Ok(self
            .samples
            .iter()
            .rev()
            .filter(|s| session_id.map_or(true, |id| s.session_id == id))
            .take(limit.min(MAX_RECENT))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &mut dyn MetricStore) -> Result<()> {
        for n in 0..5 {
            store.append(&NewMetric::now("local", "progress", json!({ "n": n })))?;
        }
        store.append(&NewMetric::now("other", "progress", json!({ "n": 99 })))?;

        let newest = store.recent(3, Some("local"))?;
        let ns: Vec<i64> = newest
            .iter()
            .map(|s| s.value["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![4, 3, 2]);
        assert!(newest.iter().all(|s| s.kind == "progress" && s.ts.ends_with('Z')));

        let all = store.recent(100, None)?;
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].session_id, "other");
        Ok(())
    }

    #[test]
    fn sqlite_store_returns_newest_first() -> Result<()> {
        let mut store = SqliteMetricStore::open(":memory:")?;
        exercise(&mut store)
    }

    #[test]
    fn in_memory_store_matches_sqlite() -> Result<()> {
        let mut store = InMemoryMetricStore::new();
        exercise(&mut store)
    }

    #[test]
    fn sqlite_store_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("coach.db");
        let path = path.to_str().unwrap();
        {
            let mut store = SqliteMetricStore::open(path)?;
            store.append(&NewMetric::now("local", "task_passed", json!({"task": "reach"})))?;
        }
        let mut store = SqliteMetricStore::open(path)?;
        let rows = store.recent(10, None)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "task_passed");
        assert_eq!(rows[0].value["task"], "reach");
        Ok(())
    }

    #[test]
    fn sample_serializes_with_type_field() {
        let sample = MetricSample {
            id: 1,
            session_id: "local".into(),
            ts: "2026-01-01T00:00:00.000Z".into(),
            kind: "progress".into(),
            value: json!({"progress": 0.5}),
        };
        let v = serde_json::to_value(&sample).unwrap();
        assert_eq!(v["type"], "progress");
    }
}
