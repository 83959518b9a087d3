//! Client-side telemetry collector.
//!
//! Buffers vitals and errors in memory and ships them to the ingestion
//! endpoint in batches, either as soon as `batch_size` events are waiting or
//! on every `flush_interval` tick. Delivery is best effort: a failed batch is
//! logged and dropped.

pub mod replay;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::config::CollectorConfig;
use crate::event::{ClientEvent, CommonMetadata, EventType, IngestBatch, Payload};

pub use replay::ReplayBuffer;
pub use transport::{HttpTransport, RecordingTransport, Transport, TransportError};

/// A web vital measurement as reported by the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vital {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Vital {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            rating: None,
            delta: None,
            id: None,
        }
    }
}

/// An uncaught error captured on the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CapturedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Resets the single-flight flag and wakes shutdown waiters on drop.
struct FlushGuard<'a> {
    flushing: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flushing.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

struct Inner {
    cfg: CollectorConfig,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
    metadata: CommonMetadata,
    buffer: Mutex<Vec<ClientEvent>>,
    replay: Mutex<ReplayBuffer>,
    flushing: AtomicBool,
    idle: Notify,
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
}

impl Inner {
    fn push(&self, event: ClientEvent) -> bool {
        let mut buffer = self.buffer.lock();
        buffer.push(event);
        buffer.len() >= self.cfg.batch_size
    }

    async fn flush(&self) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            tracing::trace!("flush already in progress");
            return;
        }
        let _guard = FlushGuard {
            flushing: &self.flushing,
            idle: &self.idle,
        };

        let events = std::mem::take(&mut *self.buffer.lock());
        if events.is_empty() {
            return;
        }

        let count = events.len();
        let batch = IngestBatch {
            app_id: self.cfg.app_id.clone(),
            events,
            common_metadata: self.metadata.clone(),
        };

        match self.transport.send(&batch).await {
            Ok(()) => {
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(events = count, "flushed telemetry batch");
            }
            Err(e) => {
                self.batches_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(events = count, error = %e, "failed to send telemetry batch, dropping");
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.flushing.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Buffers telemetry and delivers it in batches.
pub struct Collector {
    inner: Arc<Inner>,
    handle: Option<Handle>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Validates the config and starts the periodic flush task.
    ///
    /// Must be called from within a tokio runtime. A disabled collector
    /// accepts calls but records nothing.
    pub fn start(
        cfg: CollectorConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Result<Self> {
        cfg.validate().context("invalid collector config")?;

        let metadata = CommonMetadata {
            user_agent: cfg.user_agent.clone(),
            url: cfg.page_url.clone(),
        };
        let disabled = cfg.disabled;
        let flush_interval = cfg.flush_interval;

        let inner = Arc::new(Inner {
            replay: Mutex::new(ReplayBuffer::new(cfg.replay_capacity)),
            cfg,
            transport,
            clock,
            metadata,
            buffer: Mutex::new(Vec::new()),
            flushing: AtomicBool::new(false),
            idle: Notify::new(),
            batches_sent: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
        });

        let cancel = CancellationToken::new();

        if disabled {
            tracing::info!("telemetry collection disabled");
            return Ok(Self {
                inner,
                handle: None,
                cancel,
                task: Mutex::new(None),
            });
        }

        let handle = Handle::try_current().context("collector requires a tokio runtime")?;

        let task = {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            handle.spawn(async move {
                let mut interval = tokio::time::interval(flush_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately.
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {
                            if !inner.buffer.lock().is_empty() {
                                inner.flush().await;
                            }
                        }
                    }
                }
            })
        };

        tracing::info!(
            app_id = %inner.cfg.app_id,
            batch_size = inner.cfg.batch_size,
            flush_interval = ?flush_interval,
            "telemetry collector started",
        );

        Ok(Self {
            inner,
            handle: Some(handle),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    fn enqueue(&self, event_type: EventType, payload: Payload) {
        let Some(handle) = &self.handle else {
            return;
        };

        let event = ClientEvent {
            event_type,
            payload,
            timestamp: self.inner.clock.now_ms(),
        };

        if self.inner.push(event) {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.flush().await });
        }
    }

    fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Records a web vital measurement.
    pub fn record_vital(&self, vital: Vital) {
        if !self.is_active() {
            return;
        }
        if let Some(payload) = to_payload(&vital) {
            self.enqueue(EventType::Vital, payload);
        }
    }

    /// Records an error with a copy of the current replay frames attached.
    pub fn record_error(&self, error: CapturedError) {
        if !self.is_active() {
            return;
        }
        if let Some(mut payload) = to_payload(&error) {
            self.attach_replay(&mut payload);
            self.enqueue(EventType::Error, payload);
        }
    }

    /// Records an unhandled promise rejection as an error event.
    pub fn record_rejection(&self, message: Option<&str>, stack: Option<&str>) {
        if !self.is_active() {
            return;
        }
        let mut payload = Payload::new();
        let message = message.filter(|m| !m.is_empty()).unwrap_or("Unhandled Rejection");
        payload.insert("message".to_string(), Value::from(message));
        if let Some(stack) = stack {
            payload.insert("stack".to_string(), Value::from(stack));
        }
        payload.insert("type".to_string(), Value::from("unhandledrejection"));
        self.attach_replay(&mut payload);
        self.enqueue(EventType::Error, payload);
    }

    /// Appends an opaque session replay frame.
    pub fn record_frame(&self, frame: Value) {
        if !self.is_active() {
            return;
        }
        self.inner.replay.lock().push(frame);
    }

    fn attach_replay(&self, payload: &mut Payload) {
        let frames = self.inner.replay.lock().snapshot();
        payload.insert("replayEvents".to_string(), Value::Array(frames));
    }

    /// Delivers buffered events now unless a flush is already running.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Frames currently held in the replay buffer.
    pub fn replay_len(&self) -> usize {
        self.inner.replay.lock().len()
    }

    pub fn batches_sent(&self) -> u64 {
        self.inner.batches_sent.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.inner.batches_dropped.load(Ordering::Relaxed)
    }

    /// Stops the periodic task and delivers whatever is still buffered.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "collector flush task join failed");
            }
        }

        if !self.is_active() {
            return;
        }

        self.inner.wait_idle().await;
        self.inner.flush().await;

        tracing::info!(
            sent = self.batches_sent(),
            dropped = self.batches_dropped(),
            "telemetry collector stopped",
        );
    }
}

fn to_payload<T: Serialize>(value: &T) -> Option<Payload> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize telemetry payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::clock::ManualClock;

    fn config() -> CollectorConfig {
        let mut cfg = CollectorConfig::new("app", "http://localhost:3000/api/ingest");
        cfg.user_agent = Some("test-agent".to_string());
        cfg.page_url = Some("http://localhost/page".to_string());
        cfg
    }

    fn start(cfg: CollectorConfig, transport: Arc<dyn Transport>) -> Collector {
        Collector::start(cfg, transport, Arc::new(ManualClock::new(1_000))).expect("start")
    }

    /// Lets spawned tasks run without moving paused time past any tick.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_triggers_immediate_send() {
        let transport = Arc::new(RecordingTransport::new());
        let collector = start(config(), transport.clone());

        for i in 0..5 {
            collector.record_vital(Vital::new("LCP", f64::from(i)));
        }
        settle().await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 5);
        assert_eq!(batches[0].app_id, "app");
        assert_eq!(batches[0].common_metadata.user_agent.as_deref(), Some("test-agent"));
        assert_eq!(collector.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch_once() {
        let transport = Arc::new(RecordingTransport::new());
        let collector = start(config(), transport.clone());

        collector.record_vital(Vital::new("CLS", 0.01));
        collector.record_vital(Vital::new("INP", 40.0));
        settle().await;
        assert!(transport.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let names: Vec<_> = batches[0].events.iter().map(|e| e.payload["name"].clone()).collect();
        assert_eq!(names, vec![json!("CLS"), json!("INP")]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(transport.batches().len(), 1, "empty buffer is never flushed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_dropped_not_retried() {
        let transport = Arc::new(RecordingTransport::new());
        let collector = start(config(), transport.clone());

        transport.set_failing(true);
        collector.record_vital(Vital::new("LCP", 1.0));
        collector.flush().await;
        assert_eq!(collector.batches_dropped(), 1);
        assert_eq!(collector.pending(), 0);

        transport.set_failing(false);
        collector.record_vital(Vital::new("LCP", 2.0));
        collector.flush().await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 1);
        assert_eq!(batches[0].events[0].payload["value"], json!(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_carries_replay_copy() {
        let transport = Arc::new(RecordingTransport::new());
        let mut cfg = config();
        cfg.replay_capacity = 2;
        let collector = start(cfg, transport.clone());

        collector.record_frame(json!({"t": 1}));
        collector.record_frame(json!({"t": 2}));
        collector.record_frame(json!({"t": 3}));
        assert_eq!(collector.replay_len(), 2);

        let mut err = CapturedError::new("boom");
        err.stack = Some("at f (main.js:1:1)".to_string());
        collector.record_error(err);
        collector.record_frame(json!({"t": 4}));
        collector.flush().await;

        let batches = transport.batches();
        let payload = &batches[0].events[0].payload;
        assert_eq!(batches[0].events[0].event_type, EventType::Error);
        assert_eq!(payload["message"], "boom");
        assert_eq!(payload["replayEvents"], json!([{"t": 2}, {"t": 3}]));
        assert_eq!(collector.replay_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_defaults() {
        let transport = Arc::new(RecordingTransport::new());
        let collector = start(config(), transport.clone());

        collector.record_rejection(None, None);
        collector.record_rejection(Some("nope"), Some("stack"));
        collector.flush().await;

        let events = &transport.batches()[0].events;
        assert_eq!(events[0].payload["message"], "Unhandled Rejection");
        assert_eq!(events[0].payload["type"], "unhandledrejection");
        assert_eq!(events[1].payload["message"], "nope");
        assert_eq!(events[1].timestamp, 1_000);
    }

    struct GatedTransport {
        gate: Semaphore,
        inner: RecordingTransport,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, batch: &IngestBatch) -> Result<(), TransportError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            permit.forget();
            self.inner.send(batch).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_and_shutdown_flush() {
        let transport = Arc::new(GatedTransport {
            gate: Semaphore::new(0),
            inner: RecordingTransport::new(),
        });
        let collector = start(config(), transport.clone());

        for i in 0..5 {
            collector.record_vital(Vital::new("LCP", f64::from(i)));
        }
        settle().await;

        // First batch is in flight and blocked; these accumulate.
        for i in 5..12 {
            collector.record_vital(Vital::new("LCP", f64::from(i)));
        }
        settle().await;
        assert_eq!(collector.pending(), 7);

        transport.gate.add_permits(10);
        collector.shutdown().await;

        let batches = transport.inner.batches();
        let sizes: Vec<_> = batches.iter().map(|b| b.events.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 12);
        assert_eq!(sizes[0], 5);
        assert_eq!(collector.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_collector_records_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let mut cfg = config();
        cfg.disabled = true;
        let collector = start(cfg, transport.clone());

        collector.record_vital(Vital::new("LCP", 1.0));
        collector.record_frame(json!(1));
        collector.shutdown().await;

        assert_eq!(collector.pending(), 0);
        assert_eq!(collector.replay_len(), 0);
        assert!(transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.batch_size = 0;
        let result = Collector::start(
            cfg,
            Arc::new(RecordingTransport::new()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(result.is_err());
    }
}
