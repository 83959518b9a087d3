use parking_lot::RwLock;

use super::{ErrorFilter, EventStore, StoreError, StoredEvent};
use crate::event::{Event, EventType, Payload};

/// Ephemeral in-process event store.
///
/// Events are kept in insertion order; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events across all applications.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

fn to_stored(event: &Event) -> StoredEvent {
    StoredEvent {
        id: event.id.clone(),
        event_type: event.event_type,
        timestamp: event.timestamp,
        payload: event.payload.clone(),
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, event: &Event) -> Result<(), StoreError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    fn query_vitals(&self, app_id: &str, since: i64) -> Result<Vec<Payload>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.app_id == app_id && e.event_type == EventType::Vital && e.timestamp > since)
            .map(|e| e.payload.clone())
            .collect())
    }

    fn count_errors(&self, app_id: &str, since: i64) -> Result<u64, StoreError> {
        let count = self
            .events
            .read()
            .iter()
            .filter(|e| e.app_id == app_id && e.event_type == EventType::Error && e.timestamp > since)
            .count();
        Ok(count as u64)
    }

    fn list_recent_errors(
        &self,
        app_id: &str,
        since: i64,
        limit: usize,
        filter: &ErrorFilter,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self.events.read();
        let mut errors: Vec<&Event> = events
            .iter()
            .filter(|e| e.app_id == app_id && e.event_type == EventType::Error && e.timestamp > since)
            .filter(|e| filter.matches(&e.payload))
            .collect();
        // Stable sort keeps later appends first among equal timestamps.
        errors.reverse();
        errors.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(errors.into_iter().take(limit).map(to_stored).collect())
    }

    fn list_all(&self, app_id: &str, since: i64) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self.events.read();
        let mut all: Vec<StoredEvent> = events
            .iter()
            .filter(|e| e.app_id == app_id && e.timestamp > since)
            .map(to_stored)
            .collect();
        all.sort_by_key(|e| e.timestamp);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_append_then_list_all() {
        conformance::append_then_list_all(&MemoryEventStore::new());
    }

    #[test]
    fn test_scoping_and_strict_since() {
        conformance::scoping_and_strict_since(&MemoryEventStore::new());
    }

    #[test]
    fn test_vitals_only() {
        conformance::vitals_only(&MemoryEventStore::new());
    }

    #[test]
    fn test_recent_errors_filtered_before_limit() {
        conformance::recent_errors_filtered_before_limit(&MemoryEventStore::new());
    }

    #[test]
    fn test_len() {
        let store = MemoryEventStore::new();
        assert!(store.is_empty());
        conformance::vitals_only(&store);
        assert_eq!(store.len(), 2);
    }
}
