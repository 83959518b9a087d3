use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;

use crate::event::EventType;
use crate::store::StoredEvent;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Event counts for one UTC hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBucket {
    /// Hour start, epoch milliseconds.
    pub time: i64,
    /// Hour start as an RFC 3339 UTC string.
    pub label: String,
    pub vitals: u64,
    pub errors: u64,
}

/// Start of the UTC hour containing `ts`.
pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR_MS)
}

fn hour_label(hour: i64) -> String {
    DateTime::from_timestamp_millis(hour)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Buckets vitals and errors by hour, ascending. Hours with neither are
/// omitted, so navigation-only hours never appear.
pub fn hourly_buckets(events: &[StoredEvent]) -> Vec<TimeBucket> {
    let mut counts: BTreeMap<i64, (u64, u64)> = BTreeMap::new();

    for event in events {
        let hour = hour_start(event.timestamp);
        match event.event_type {
            EventType::Vital => counts.entry(hour).or_default().0 += 1,
            EventType::Error => counts.entry(hour).or_default().1 += 1,
            EventType::Navigation | EventType::Unknown => {}
        }
    }

    counts
        .into_iter()
        .map(|(time, (vitals, errors))| TimeBucket {
            time,
            label: hour_label(time),
            vitals,
            errors,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::event::Payload;

    fn at(h: u32, m: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0)
            .single()
            .expect("valid time")
            .timestamp_millis()
    }

    fn stored(t: EventType, ts: i64) -> StoredEvent {
        StoredEvent {
            id: format!("{t}-{ts}"),
            event_type: t,
            timestamp: ts,
            payload: Payload::new(),
        }
    }

    #[test]
    fn test_buckets_by_utc_hour() {
        let events = vec![
            stored(EventType::Vital, at(10, 5)),
            stored(EventType::Vital, at(10, 55)),
            stored(EventType::Error, at(11, 10)),
        ];

        let buckets = hourly_buckets(&events);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].time, at(10, 0));
        assert_eq!((buckets[0].vitals, buckets[0].errors), (2, 0));
        assert_eq!(buckets[0].label, "2024-05-01T10:00:00.000Z");
        assert_eq!(buckets[1].time, at(11, 0));
        assert_eq!((buckets[1].vitals, buckets[1].errors), (0, 1));
    }

    #[test]
    fn test_navigation_only_hours_are_not_materialized() {
        let events = vec![
            stored(EventType::Navigation, at(3, 30)),
            stored(EventType::Unknown, at(4, 10)),
        ];
        assert!(hourly_buckets(&events).is_empty());

        let mixed = vec![
            stored(EventType::Navigation, at(5, 1)),
            stored(EventType::Vital, at(5, 2)),
            stored(EventType::Navigation, at(6, 0)),
        ];
        let buckets = hourly_buckets(&mixed);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].time, at(5, 0));
        assert_eq!((buckets[0].vitals, buckets[0].errors), (1, 0));
    }

    #[test]
    fn test_output_ascending_regardless_of_input_order() {
        let events = vec![
            stored(EventType::Error, at(12, 0)),
            stored(EventType::Error, at(9, 59)),
        ];
        let times: Vec<_> = hourly_buckets(&events).iter().map(|b| b.time).collect();
        assert_eq!(times, vec![at(9, 0), at(12, 0)]);
    }

    #[test]
    fn test_hour_start_before_epoch() {
        assert_eq!(hour_start(-1), -HOUR_MS);
        assert_eq!(hour_start(HOUR_MS + 1), HOUR_MS);
    }
}
