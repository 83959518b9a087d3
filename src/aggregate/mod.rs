//! Read-side aggregation over the event store.

pub mod demographics;
pub mod percentile;
pub mod series;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::clock::{duration_ms, SharedClock};
use crate::event::Payload;
use crate::store::{run_blocking, ErrorFilter, SharedStore, StoreError, StoredEvent};
use crate::symbolicate::Symbolicator;

pub use demographics::{Demographics, NameValue};
pub use percentile::{rate, Rating, KNOWN_VITALS};
pub use series::TimeBucket;

/// Aggregation window ending now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Period {
    OneHour,
    #[default]
    OneDay,
    SevenDays,
}

impl Period {
    /// Parses `1h`, `24h` or `7d`. Anything else is 24 hours.
    pub fn parse(token: &str) -> Self {
        match token {
            "1h" => Self::OneHour,
            "7d" => Self::SevenDays,
            _ => Self::OneDay,
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::OneDay => Duration::from_secs(24 * 60 * 60),
            Self::SevenDays => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Exclusive lower bound of the window ending at `now_ms`.
    pub fn since(self, now_ms: i64) -> i64 {
        now_ms - duration_ms(self.duration())
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::OneDay => "24h",
            Self::SevenDays => "7d",
        }
    }
}

/// P75 summary of one web vital.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalMetric {
    pub name: String,
    /// P75 rounded to two decimals.
    pub value: f64,
    pub rating: Rating,
}

/// Error event as shown in the recent-error listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Everything the dashboard overview needs in one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub vitals: Vec<VitalMetric>,
    pub error_count: u64,
    pub recent_errors: Vec<ErrorSummary>,
}

/// Computes the P75 of each known vital from raw vital payloads.
///
/// Payloads with unknown names or non-numeric values are ignored. Vitals with
/// no samples report `0` rated good.
pub fn compute_vitals(payloads: &[Payload]) -> Vec<VitalMetric> {
    let mut samples: HashMap<&str, Vec<f64>> =
        KNOWN_VITALS.iter().map(|name| (*name, Vec::new())).collect();

    for payload in payloads {
        let Some(name) = payload.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(value) = payload.get("value").and_then(Value::as_f64) else {
            continue;
        };
        if let Some(values) = samples.get_mut(name) {
            values.push(value);
        }
    }

    KNOWN_VITALS
        .iter()
        .map(|name| {
            let values = samples.get_mut(name).map(Vec::as_mut_slice).unwrap_or_default();
            match percentile::p75(values) {
                Some(p) => VitalMetric {
                    name: (*name).to_string(),
                    value: percentile::round2(p),
                    rating: rate(name, p),
                },
                None => VitalMetric {
                    name: (*name).to_string(),
                    value: 0.0,
                    rating: Rating::Good,
                },
            }
        })
        .collect()
}

/// Dashboard queries over an event store.
pub struct Aggregator {
    store: SharedStore,
    symbolicator: Arc<Symbolicator>,
    clock: SharedClock,
    recent_limit: usize,
    fallback_release: String,
}

impl Aggregator {
    pub fn new(
        store: SharedStore,
        symbolicator: Arc<Symbolicator>,
        clock: SharedClock,
        recent_limit: usize,
        fallback_release: impl Into<String>,
    ) -> Self {
        Self {
            store,
            symbolicator,
            clock,
            recent_limit,
            fallback_release: fallback_release.into(),
        }
    }

    /// Vitals, error count and the symbolicated recent errors for a window.
    pub async fn dashboard(
        &self,
        app_id: &str,
        period: Period,
        filter: &ErrorFilter,
    ) -> Result<DashboardStats, StoreError> {
        let since = period.since(self.clock.now_ms());

        let app = app_id.to_string();
        let payloads = run_blocking(&self.store, move |s| s.query_vitals(&app, since)).await?;

        let app = app_id.to_string();
        let error_count = run_blocking(&self.store, move |s| s.count_errors(&app, since)).await?;

        let recent_errors = self.recent_errors(app_id, since, filter).await?;

        Ok(DashboardStats {
            vitals: compute_vitals(&payloads),
            error_count,
            recent_errors,
        })
    }

    /// Newest error events after `since`, stacks symbolicated.
    pub async fn recent_errors(
        &self,
        app_id: &str,
        since: i64,
        filter: &ErrorFilter,
    ) -> Result<Vec<ErrorSummary>, StoreError> {
        let app = app_id.to_string();
        let limit = self.recent_limit;
        let filter = filter.clone();
        let errors = run_blocking(&self.store, move |s| {
            s.list_recent_errors(&app, since, limit, &filter)
        })
        .await?;

        let mut out = Vec::with_capacity(errors.len());
        for error in errors {
            out.push(self.summarize(error).await);
        }
        Ok(out)
    }

    async fn summarize(&self, error: StoredEvent) -> ErrorSummary {
        let StoredEvent {
            id,
            timestamp,
            mut payload,
            ..
        } = error;

        if let Some(stack) = payload.get("stack").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            let release = payload
                .get("release")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or(&self.fallback_release);
            let symbolicated = self.symbolicator.symbolicate(stack, release).await;
            payload.insert("stack".to_string(), Value::String(symbolicated));
        }

        ErrorSummary {
            id,
            timestamp,
            payload,
        }
    }

    /// Hourly vital/error counts for a window.
    pub async fn time_series(&self, app_id: &str, period: Period) -> Result<Vec<TimeBucket>, StoreError> {
        let events = self.window(app_id, period).await?;
        Ok(series::hourly_buckets(&events))
    }

    /// Browser and country breakdown for a window.
    pub async fn demographics(&self, app_id: &str, period: Period) -> Result<Demographics, StoreError> {
        let events = self.window(app_id, period).await?;
        Ok(demographics::tally(&events))
    }

    async fn window(&self, app_id: &str, period: Period) -> Result<Vec<StoredEvent>, StoreError> {
        let since = period.since(self.clock.now_ms());
        let app = app_id.to_string();
        run_blocking(&self.store, move |s| s.list_all(&app, since)).await
    }
}
