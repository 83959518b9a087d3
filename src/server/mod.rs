//! HTTP API: ingestion, dashboard reads, source map upload and error insight.

pub mod health;

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::aggregate::{Aggregator, Period};
use crate::alert::{AlertEngine, AlertPolicy, Notifier, WebhookNotifier};
use crate::clock::SharedClock;
use crate::codec::{self, DecodeError};
use crate::config::Config;
use crate::ingest::{CidrGeoResolver, GeoResolver, IngestError, Ingestor, NoopGeoResolver, RequestContext};
use crate::insight::{ErrorDescription, InsightProvider, OpenAiInsight, UNAVAILABLE};
use crate::store::{ErrorFilter, SharedStore, StoreError};
use crate::symbolicate::store::{is_safe_component, sanitize_file_name};
use crate::symbolicate::{FsSourceMapStore, SourceMapError, SourceMapStore, Symbolicator};

use self::health::HealthMetrics;

/// Shared handler state.
pub struct AppState {
    pub ingestor: Ingestor,
    pub aggregator: Aggregator,
    pub symbolicator: Arc<Symbolicator>,
    pub sourcemaps: Arc<dyn SourceMapStore>,
    pub insight: Arc<dyn InsightProvider>,
    pub metrics: Option<Arc<HealthMetrics>>,
    pub max_body_bytes: usize,
}

impl AppState {
    /// Wires every component from configuration around an opened store.
    pub fn from_config(
        cfg: &Config,
        store: SharedStore,
        clock: SharedClock,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let notifier: Option<Arc<dyn Notifier>> = if cfg.alerts.webhook_url.is_empty() {
            tracing::info!("no alert webhook configured, alerting disabled");
            None
        } else {
            let webhook = WebhookNotifier::new(
                &cfg.alerts.webhook_url,
                &cfg.alerts.username,
                cfg.alerts.timeout,
            )
            .context("building webhook client")?;
            Some(Arc::new(webhook))
        };

        let mut alerts = AlertEngine::new(
            AlertPolicy::from(&cfg.alerts),
            Arc::clone(&clock),
            notifier,
            &cfg.alerts.dashboard_url,
        );

        let geo: Arc<dyn GeoResolver> = match &cfg.geo.table_path {
            Some(path) => {
                let table = CidrGeoResolver::load(path)?;
                tracing::info!(path = %path.display(), entries = table.len(), "loaded geo table");
                Arc::new(table)
            }
            None => Arc::new(NoopGeoResolver),
        };

        let sourcemaps: Arc<dyn SourceMapStore> =
            Arc::new(FsSourceMapStore::new(&cfg.symbolication.sourcemap_dir));
        let mut symbolicator = Symbolicator::new(Arc::clone(&sourcemaps));

        if let Some(m) = &metrics {
            alerts = alerts.with_metrics(Arc::clone(m));
            symbolicator = symbolicator.with_metrics(Arc::clone(m));
        }
        let symbolicator = Arc::new(symbolicator);

        let mut ingestor = Ingestor::new(Arc::clone(&store), Arc::new(alerts), geo, Arc::clone(&clock));
        if let Some(m) = &metrics {
            ingestor = ingestor.with_metrics(Arc::clone(m));
        }

        let aggregator = Aggregator::new(
            store,
            Arc::clone(&symbolicator),
            clock,
            cfg.server.recent_error_limit,
            &cfg.symbolication.fallback_release,
        );

        let insight = OpenAiInsight::from_config(&cfg.insight).context("building insight client")?;

        Ok(Self {
            ingestor,
            aggregator,
            symbolicator,
            sourcemaps,
            insight: Arc::new(insight),
            metrics,
            max_body_bytes: cfg.server.max_body_bytes,
        })
    }
}

/// Builds the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, CONTENT_ENCODING]);

    let ingest = Router::new()
        .route("/api/ingest", post(ingest_handler).options(preflight_handler))
        .layer(cors);

    Router::new()
        .merge(ingest)
        .route("/api/stats", get(stats_handler))
        .route("/api/timeseries", get(timeseries_handler))
        .route("/api/demographics", get(demographics_handler))
        .route("/api/sourcemaps", post(upload_handler))
        .route("/api/analyze", post(analyze_handler))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local_addr = listener.local_addr().context("getting local address")?;
    tracing::info!(addr = %local_addr, "api server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving api")?;

    tracing::info!("api server stopped");

    Ok(())
}

/// Observes handler latency when dropped.
struct RouteTimer<'a> {
    metrics: Option<&'a HealthMetrics>,
    route: &'static str,
    started: Instant,
}

impl<'a> RouteTimer<'a> {
    fn start(state: &'a AppState, route: &'static str) -> Self {
        Self {
            metrics: state.metrics.as_deref(),
            route,
            started: Instant::now(),
        }
    }
}

impl Drop for RouteTimer<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.metrics {
            m.request_duration
                .with_label_values(&[self.route])
                .observe(self.started.elapsed().as_secs_f64());
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message: String = message.into();
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_failure(state: &AppState, e: &StoreError) -> Response {
    tracing::error!(error = %e, "store query failed");
    if let Some(m) = &state.metrics {
        m.store_errors.inc();
    }
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

fn header_str(headers: &HeaderMap, name: impl axum::http::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn preflight_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// POST /api/ingest
async fn ingest_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let _timer = RouteTimer::start(&state, "ingest");

    let reject = |reason: &str, message: String| {
        if let Some(m) = &state.metrics {
            m.ingest_rejected.with_label_values(&[reason]).inc();
        }
        error_response(StatusCode::BAD_REQUEST, message)
    };

    let encoding = header_str(&headers, CONTENT_ENCODING);
    let decoded = match codec::decode_body(&body, encoding.as_deref(), state.max_body_bytes) {
        Ok(decoded) => decoded,
        Err(e @ DecodeError::TooLarge { .. }) => {
            if let Some(m) = &state.metrics {
                m.ingest_rejected.with_label_values(&["too_large"]).inc();
            }
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string());
        }
        Err(e) => return reject("encoding", e.to_string()),
    };

    let value: Value = match serde_json::from_slice(&decoded) {
        Ok(value) => value,
        Err(e) => return reject("json", format!("invalid JSON body: {e}")),
    };

    let ctx = RequestContext {
        user_agent: header_str(&headers, USER_AGENT),
        forwarded_for: header_str(&headers, "x-forwarded-for"),
    };

    match state.ingestor.ingest(&value, &ctx).await {
        Ok(count) => (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "count": count })),
        )
            .into_response(),
        Err(IngestError::Validation(message)) => error_response(StatusCode::BAD_REQUEST, message),
        Err(IngestError::Store(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardQuery {
    app_id: Option<String>,
    period: Option<String>,
    user_id: Option<String>,
    has_replay: Option<String>,
}

impl DashboardQuery {
    fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref().filter(|a| !a.is_empty())
    }

    fn period(&self) -> Period {
        self.period.as_deref().map(Period::parse).unwrap_or_default()
    }

    fn filter(&self) -> ErrorFilter {
        ErrorFilter {
            user_id: self.user_id.clone().filter(|u| !u.is_empty()),
            has_replay: matches!(self.has_replay.as_deref(), Some("true" | "1")),
        }
    }
}

const MISSING_APP_ID: &str = "appId is required";

/// GET /api/stats
async fn stats_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    let _timer = RouteTimer::start(&state, "stats");
    let Some(app_id) = query.app_id() else {
        return error_response(StatusCode::BAD_REQUEST, MISSING_APP_ID);
    };

    match state
        .aggregator
        .dashboard(app_id, query.period(), &query.filter())
        .await
    {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_failure(&state, &e),
    }
}

/// GET /api/timeseries
async fn timeseries_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    let _timer = RouteTimer::start(&state, "timeseries");
    let Some(app_id) = query.app_id() else {
        return error_response(StatusCode::BAD_REQUEST, MISSING_APP_ID);
    };

    match state.aggregator.time_series(app_id, query.period()).await {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => store_failure(&state, &e),
    }
}

/// GET /api/demographics
async fn demographics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    let _timer = RouteTimer::start(&state, "demographics");
    let Some(app_id) = query.app_id() else {
        return error_response(StatusCode::BAD_REQUEST, MISSING_APP_ID);
    };

    match state.aggregator.demographics(app_id, query.period()).await {
        Ok(demographics) => Json(demographics).into_response(),
        Err(e) => store_failure(&state, &e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    release: Option<String>,
    name: Option<String>,
}

/// POST /api/sourcemaps?release=..&name=..
async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    let _timer = RouteTimer::start(&state, "sourcemaps");

    let (Some(release), Some(name)) = (query.release.as_deref(), query.name.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing file or release");
    };
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing file or release");
    }
    if !is_safe_component(release) {
        return error_response(StatusCode::BAD_REQUEST, "invalid release");
    }
    let Some(file) = sanitize_file_name(name) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid file name");
    };

    match state.sourcemaps.put(release, file, &body).await {
        Ok(()) => {}
        Err(SourceMapError::InvalidName(n)) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid name {n:?}"));
        }
        Err(e) => {
            tracing::error!(release, file, error = %e, "source map upload failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upload failed");
        }
    }

    state.symbolicator.invalidate(release, file);
    if let Some(m) = &state.metrics {
        m.sourcemaps_uploaded.inc();
    }

    let digest = Sha256::digest(&body);
    let mut sha256 = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(sha256, "{byte:02x}");
    }

    Json(json!({
        "success": true,
        "path": format!("{release}/{file}"),
        "sha256": sha256,
    }))
    .into_response()
}

/// POST /api/analyze
async fn analyze_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let _timer = RouteTimer::start(&state, "analyze");

    let error = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(mut fields)) => fields.remove("error"),
        _ => None,
    };
    let error = error
        .filter(Value::is_object)
        .and_then(|e| serde_json::from_value::<ErrorDescription>(e).ok());

    let Some(error) = error else {
        return error_response(StatusCode::BAD_REQUEST, "Missing error data");
    };

    let outcome = state.insight.explain(&error).await;
    let label = if outcome.is_ok() { "ok" } else { "unavailable" };
    if let Some(m) = &state.metrics {
        m.insight_requests.with_label_values(&[label]).inc();
    }

    match outcome {
        Ok(insight) => Json(json!({ "insight": insight })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "insight request failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "insight": UNAVAILABLE })),
            )
                .into_response()
        }
    }
}
