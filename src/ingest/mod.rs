//! Server-side ingestion: validate a batch, normalize and enrich each event,
//! persist it, and feed it to the alert engine.

pub mod device;
pub mod geo;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::alert::AlertEngine;
use crate::clock::SharedClock;
use crate::event::{Event, EventType, Payload};
use crate::server::health::HealthMetrics;
use crate::store::{run_blocking, SharedStore, StoreError};

pub use device::{parse_user_agent, DeviceInfo, DeviceType};
pub use geo::{client_ip, CidrGeoResolver, GeoLocation, GeoResolver, NoopGeoResolver};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Request attributes used for enrichment.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// `User-Agent` request header.
    pub user_agent: Option<String>,
    /// Raw `X-Forwarded-For` request header.
    pub forwarded_for: Option<String>,
}

/// Normalizes and persists ingestion batches.
pub struct Ingestor {
    store: SharedStore,
    alerts: Arc<AlertEngine>,
    geo: Arc<dyn GeoResolver>,
    clock: SharedClock,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Ingestor {
    pub fn new(
        store: SharedStore,
        alerts: Arc<AlertEngine>,
        geo: Arc<dyn GeoResolver>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            alerts,
            geo,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates a raw batch and builds the events to persist.
    ///
    /// Every event gets a fresh id and the server receipt time. The payload
    /// is the batch metadata overlaid by the event's own fields, with a
    /// nested `payload` object lifted to the top level. `device` and `geo`
    /// are always replaced by server-side inference.
    pub fn normalize(&self, body: &Value, ctx: &RequestContext) -> Result<Vec<Event>, IngestError> {
        let body = body
            .as_object()
            .ok_or_else(|| IngestError::Validation("body must be a JSON object".to_string()))?;

        let app_id = body
            .get("appId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::Validation("appId must be a non-empty string".to_string()))?;

        let events = body
            .get("events")
            .and_then(Value::as_array)
            .ok_or_else(|| IngestError::Validation("events must be an array".to_string()))?;

        let metadata = body.get("commonMetadata").and_then(Value::as_object);

        let user_agent = metadata
            .and_then(|m| m.get("userAgent"))
            .and_then(Value::as_str)
            .or(ctx.user_agent.as_deref());
        let device = user_agent.map(parse_user_agent).unwrap_or_default();
        let device = serde_json::to_value(&device).unwrap_or(Value::Null);

        let ip = client_ip(ctx.forwarded_for.as_deref());
        let location = geo::locate(self.geo.as_ref(), ip);
        let location = serde_json::to_value(&location).unwrap_or(Value::Null);

        let now = self.clock.now_ms();

        Ok(events
            .iter()
            .map(|raw| {
                let event_type = raw
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(EventType::Unknown, EventType::from_name);

                let mut payload = merge_payload(metadata, raw.as_object());
                payload.insert("device".to_string(), device.clone());
                payload.insert("geo".to_string(), location.clone());

                Event {
                    id: Uuid::new_v4().to_string(),
                    app_id: app_id.to_string(),
                    event_type,
                    timestamp: now,
                    payload,
                }
            })
            .collect())
    }

    /// Ingests one raw batch, returning the number of events accepted.
    pub async fn ingest(&self, body: &Value, ctx: &RequestContext) -> Result<usize, IngestError> {
        let events = match self.normalize(body, ctx) {
            Ok(events) => events,
            Err(e) => {
                self.reject("validation");
                return Err(e);
            }
        };
        let count = events.len();

        let events = Arc::new(events);
        let to_store = Arc::clone(&events);
        let appended = run_blocking(&self.store, move |store| {
            for event in to_store.iter() {
                store.append(event)?;
            }
            Ok(())
        })
        .await;

        if let Err(e) = appended {
            tracing::error!(error = %e, events = count, "failed to persist ingested events");
            self.reject("store");
            if let Some(m) = &self.metrics {
                m.store_errors.inc();
            }
            return Err(IngestError::Store(e));
        }

        for event in events.iter() {
            if let Some(m) = &self.metrics {
                m.events_ingested
                    .with_label_values(&[event.event_type.as_str()])
                    .inc();
            }
            let alerts = self.alerts.observe(event);
            if !alerts.is_empty() {
                self.alerts.dispatch(alerts);
            }
        }

        tracing::debug!(events = count, "ingested batch");

        Ok(count)
    }

    fn reject(&self, reason: &str) {
        if let Some(m) = &self.metrics {
            m.ingest_rejected.with_label_values(&[reason]).inc();
        }
    }
}

/// Metadata first, then event fields, then the nested payload's fields.
fn merge_payload(metadata: Option<&Map<String, Value>>, event: Option<&Map<String, Value>>) -> Payload {
    let mut payload = metadata.cloned().unwrap_or_default();

    let Some(event) = event else {
        return payload;
    };

    for (key, value) in event {
        match key.as_str() {
            "payload" if value.is_object() => {}
            "timestamp" => {
                payload.insert("clientTimestamp".to_string(), value.clone());
            }
            _ => {
                payload.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(nested) = event.get("payload").and_then(Value::as_object) {
        for (key, value) in nested {
            payload.insert(key.clone(), value.clone());
        }
    }

    payload
}
