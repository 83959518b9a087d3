use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use super::{ErrorFilter, EventStore, StoreError, StoredEvent};
use crate::event::{Event, EventType, Payload};
use crate::migrate::SqliteMigrator;

/// Durable event store backed by a single SQLite connection.
#[derive(Debug)]
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Opens (or creates) the database at `path` and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        SqliteMigrator::new(&conn)
            .up()
            .map_err(|e| StoreError::Migration(format!("{e:#}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn decode_payload(raw: &str) -> Result<Payload, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn read_stored(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_stored(
    (id, event_type, timestamp, payload): (String, String, i64, String),
) -> Result<StoredEvent, StoreError> {
    Ok(StoredEvent {
        id,
        event_type: EventType::from_name(&event_type),
        timestamp,
        payload: decode_payload(&payload)?,
    })
}

impl EventStore for SqliteEventStore {
    fn append(&self, event: &Event) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn.lock().execute(
            "INSERT INTO events (id, app_id, type, timestamp, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.app_id,
                event.event_type.as_str(),
                event.timestamp,
                payload,
            ],
        )?;
        Ok(())
    }

    fn query_vitals(&self, app_id: &str, since: i64) -> Result<Vec<Payload>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM events WHERE app_id = ?1 AND type = 'vital' AND timestamp > ?2",
        )?;
        let rows = stmt.query_map(params![app_id, since], |row| row.get::<_, String>(0))?;

        let mut payloads = Vec::new();
        for raw in rows {
            payloads.push(decode_payload(&raw?)?);
        }
        Ok(payloads)
    }

    fn count_errors(&self, app_id: &str, since: i64) -> Result<u64, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT count(*) FROM events WHERE app_id = ?1 AND type = 'error' AND timestamp > ?2",
            params![app_id, since],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn list_recent_errors(
        &self,
        app_id: &str,
        since: i64,
        limit: usize,
        filter: &ErrorFilter,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn.lock();

        if filter.is_empty() {
            let mut stmt = conn.prepare_cached(
                "SELECT id, type, timestamp, payload FROM events
                 WHERE app_id = ?1 AND type = 'error' AND timestamp > ?2
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?3",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![app_id, since, limit], read_stored)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(into_stored(row?)?);
            }
            return Ok(out);
        }

        // Filters look inside the JSON payload, so scan newest-first until
        // enough rows pass.
        let mut stmt = conn.prepare_cached(
            "SELECT id, type, timestamp, payload FROM events
             WHERE app_id = ?1 AND type = 'error' AND timestamp > ?2
             ORDER BY timestamp DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![app_id, since], read_stored)?;
        let mut out = Vec::new();
        for row in rows {
            if out.len() >= limit {
                break;
            }
            let stored = into_stored(row?)?;
            if filter.matches(&stored.payload) {
                out.push(stored);
            }
        }
        Ok(out)
    }

    fn list_all(&self, app_id: &str, since: i64) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, type, timestamp, payload FROM events
             WHERE app_id = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![app_id, since], read_stored)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(into_stored(row?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::conformance;

    fn store() -> SqliteEventStore {
        SqliteEventStore::open_in_memory().expect("open in-memory store")
    }

    #[test]
    fn test_append_then_list_all() {
        conformance::append_then_list_all(&store());
    }

    #[test]
    fn test_scoping_and_strict_since() {
        conformance::scoping_and_strict_since(&store());
    }

    #[test]
    fn test_vitals_only() {
        conformance::vitals_only(&store());
    }

    #[test]
    fn test_recent_errors_filtered_before_limit() {
        conformance::recent_errors_filtered_before_limit(&store());
    }

    #[test]
    fn test_duplicate_id_is_store_error() {
        let store = store();
        let e = conformance::event("dup", "app", EventType::Error, 1, json!({}));
        store.append(&e).expect("first append");
        assert!(matches!(store.append(&e), Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn test_reopen_file_keeps_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");

        {
            let store = SqliteEventStore::open(&path).expect("open");
            store
                .append(&conformance::event("a", "app", EventType::Vital, 5, json!({"name": "LCP"})))
                .expect("append");
        }

        let reopened = SqliteEventStore::open(&path).expect("reopen");
        assert_eq!(reopened.list_all("app", 0).expect("list").len(), 1);
    }

    #[test]
    fn test_unknown_type_round_trips() {
        let store = store();
        store
            .append(&conformance::event("u", "app", EventType::Unknown, 5, json!({"k": 1})))
            .expect("append");
        let all = store.list_all("app", 0).expect("list");
        assert_eq!(all[0].event_type, EventType::Unknown);
    }
}
