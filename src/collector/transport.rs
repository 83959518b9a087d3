use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::codec;
use crate::config::CollectorConfig;
use crate::event::IngestBatch;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serializing batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compressing batch: {0}")]
    Compress(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Delivers a batch to the ingestion endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &IngestBatch) -> Result<(), TransportError>;
}

/// JSON-over-HTTP transport with optional body compression.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    compression: String,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(cfg: &CollectorConfig) -> Result<Self, TransportError> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.export_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        Ok(Self {
            client: client_builder.build()?,
            url: cfg.ingest_url.clone(),
            compression: cfg.compression.clone(),
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &IngestBatch) -> Result<(), TransportError> {
        let body = serde_json::to_vec(batch)?;
        let raw_len = body.len();
        let body = codec::compress(&body, &self.compression)
            .map_err(|e| TransportError::Compress(format!("{e:#}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(encoding) = codec::content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        tracing::debug!(events = batch.events.len(), bytes = raw_len, "delivered batch");

        Ok(())
    }
}

/// In-memory transport that records every batch; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<IngestBatch>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail without recording.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<IngestBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: &IngestBatch) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("recording transport set to fail".to_string()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
