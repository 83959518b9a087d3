use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_address;

/// Prometheus metrics for server health and observability.
///
/// All metrics use the "vitalscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events persisted by event type.
    pub events_ingested: CounterVec,
    /// Ingestion requests rejected by reason.
    pub ingest_rejected: CounterVec,
    /// Store operation failures.
    pub store_errors: Counter,
    /// Alerts delivered by kind.
    pub alerts_sent: CounterVec,
    /// Alert deliveries that failed, by kind.
    pub alerts_failed: CounterVec,
    /// Stack frames looked up, by result (hit/miss).
    pub symbolication_lookups: CounterVec,
    /// Source maps written through the upload endpoint.
    pub sourcemaps_uploaded: Counter,
    /// Insight requests by outcome.
    pub insight_requests: CounterVec,
    /// HTTP handler latency by route.
    pub request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_ingested = CounterVec::new(
            Opts::new("events_ingested_total", "Total events persisted by event type.")
                .namespace("vitalscope"),
            &["event_type"],
        )?;
        let ingest_rejected = CounterVec::new(
            Opts::new(
                "ingest_rejected_total",
                "Total ingestion requests rejected by reason.",
            )
            .namespace("vitalscope"),
            &["reason"],
        )?;
        let store_errors = Counter::with_opts(
            Opts::new("store_errors_total", "Total event store failures.")
                .namespace("vitalscope"),
        )?;
        let alerts_sent = CounterVec::new(
            Opts::new("alerts_sent_total", "Total alerts delivered by kind.")
                .namespace("vitalscope"),
            &["kind"],
        )?;
        let alerts_failed = CounterVec::new(
            Opts::new(
                "alerts_failed_total",
                "Total alert deliveries that failed by kind.",
            )
            .namespace("vitalscope"),
            &["kind"],
        )?;
        let symbolication_lookups = CounterVec::new(
            Opts::new(
                "symbolication_lookups_total",
                "Total stack frame lookups by result.",
            )
            .namespace("vitalscope"),
            &["result"],
        )?;
        let sourcemaps_uploaded = Counter::with_opts(
            Opts::new("sourcemaps_uploaded_total", "Total source maps uploaded.")
                .namespace("vitalscope"),
        )?;
        let insight_requests = CounterVec::new(
            Opts::new("insight_requests_total", "Total insight requests by outcome.")
                .namespace("vitalscope"),
            &["outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "HTTP handler duration by route.",
            )
            .namespace("vitalscope")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["route"],
        )?;

        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(alerts_sent.clone()))?;
        registry.register(Box::new(alerts_failed.clone()))?;
        registry.register(Box::new(symbolication_lookups.clone()))?;
        registry.register(Box::new(sourcemaps_uploaded.clone()))?;
        registry.register(Box::new(insight_requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_ingested,
            ingest_rejected,
            store_errors,
            alerts_sent,
            alerts_failed,
            symbolication_lookups,
            sourcemaps_uploaded,
            insight_requests,
            request_duration,
        })
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = bind_address(addr);

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(metrics): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
