//! Append-only event store.
//!
//! Events are written once and only ever range-queried afterwards. Every read
//! is scoped by application id and only sees events strictly newer than the
//! supplied `since` bound.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::event::{EventType, Payload};

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("store task failed: {0}")]
    Task(String),
}

/// A persisted event as returned by listing queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: i64,
    pub payload: Payload,
}

/// Optional narrowing applied to error listings before the limit is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFilter {
    /// Only errors whose `payload.userId` equals this value.
    pub user_id: Option<String>,
    /// Only errors carrying a non-empty `payload.replayEvents` array.
    pub has_replay: bool,
}

impl ErrorFilter {
    /// Returns true when no narrowing is requested.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && !self.has_replay
    }

    /// Returns true if the payload passes every requested filter.
    pub fn matches(&self, payload: &Payload) -> bool {
        if let Some(user_id) = &self.user_id {
            if payload.get("userId").and_then(Value::as_str) != Some(user_id.as_str()) {
                return false;
            }
        }
        if self.has_replay {
            let has_frames = payload
                .get("replayEvents")
                .and_then(Value::as_array)
                .is_some_and(|frames| !frames.is_empty());
            if !has_frames {
                return false;
            }
        }
        true
    }
}

/// Storage backend for telemetry events.
///
/// Calls are blocking; async callers run them on the blocking pool.
pub trait EventStore: Send + Sync {
    /// Persist one event. The payload is stored as serialized JSON.
    fn append(&self, event: &crate::event::Event) -> Result<(), StoreError>;

    /// Payloads of vital events newer than `since`.
    fn query_vitals(&self, app_id: &str, since: i64) -> Result<Vec<Payload>, StoreError>;

    /// Number of error events newer than `since`.
    fn count_errors(&self, app_id: &str, since: i64) -> Result<u64, StoreError>;

    /// Newest-first error events newer than `since`, filtered then limited.
    fn list_recent_errors(
        &self,
        app_id: &str,
        since: i64,
        limit: usize,
        filter: &ErrorFilter,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Every event newer than `since`, oldest first.
    fn list_all(&self, app_id: &str, since: i64) -> Result<Vec<StoredEvent>, StoreError>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn EventStore>;

/// Runs a store call on the blocking thread pool.
pub async fn run_blocking<T, F>(store: &SharedStore, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn EventStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
