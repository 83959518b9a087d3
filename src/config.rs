use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::codec;

/// Top-level configuration for the vitalscope server.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// HTTP API configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Event store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Alert engine configuration.
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Stack symbolication configuration.
    #[serde(default)]
    pub symbolication: SymbolicationConfig,

    /// Geo enrichment configuration.
    #[serde(default)]
    pub geo: GeoConfig,

    /// Error insight provider configuration.
    #[serde(default)]
    pub insight: InsightConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":3000".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Maximum accepted request body in bytes. Default: 5MB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Number of errors returned by the recent-error listing. Default: 10.
    #[serde(default = "default_recent_error_limit")]
    pub recent_error_limit: usize,
}

/// Event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Empty means an in-memory, non-durable store.
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Alert engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Webhook endpoint. Empty disables alerting.
    #[serde(default)]
    pub webhook_url: String,

    /// Username attached to webhook messages.
    #[serde(default = "default_alert_username")]
    pub username: String,

    /// Dashboard link embedded in messages.
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,

    /// Error rate window. Default: 60s.
    #[serde(default = "default_error_window", with = "humantime_serde")]
    pub error_window: Duration,

    /// Errors within one window that trigger the rate alert. Default: 10.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Maximum fingerprints remembered before the set is cleared. Default: 1000.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Minimum time between budget alerts for one metric. Default: 10m.
    #[serde(default = "default_budget_cooldown", with = "humantime_serde")]
    pub budget_cooldown: Duration,

    /// Performance budgets keyed by vital name.
    #[serde(default = "default_budgets")]
    pub budgets: HashMap<String, f64>,

    /// Webhook request timeout. Default: 10s.
    #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Stack symbolication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolicationConfig {
    /// Directory holding `<release>/<file>.map` source maps.
    #[serde(default = "default_sourcemap_dir")]
    pub sourcemap_dir: PathBuf,

    /// Release used when an error does not declare one. Default: "1.0.0".
    #[serde(default = "default_fallback_release")]
    pub fallback_release: String,
}

/// Geo enrichment configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GeoConfig {
    /// Optional CSV of `cidr,country,city` rows.
    #[serde(default)]
    pub table_path: Option<PathBuf>,
}

/// Error insight provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightConfig {
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_insight_endpoint")]
    pub endpoint: String,

    /// Model name. Default: "gpt-3.5-turbo".
    #[serde(default = "default_insight_model")]
    pub model: String,

    /// Environment variable that holds the API key.
    #[serde(default = "default_insight_key_env")]
    pub api_key_env: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_insight_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Collector configuration (the client agent, not the server).
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Application identifier sent with every batch.
    pub app_id: String,

    /// Ingestion endpoint URL.
    pub ingest_url: String,

    /// Buffered events that force an immediate flush. Default: 5.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Replay frames kept in memory. Default: 100.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// Maximum duration for one delivery. Default: 10s.
    #[serde(default = "default_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Keep HTTP connections alive between batches. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// User agent reported in batch metadata.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Page URL reported in batch metadata.
    #[serde(default)]
    pub page_url: Option<String>,

    /// Disable all capture. Default: false.
    #[serde(default)]
    pub disabled: bool,
}

// --- Default value functions ---

fn default_listen_addr() -> String {
    ":3000".to_string()
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_recent_error_limit() -> usize {
    10
}

fn default_store_path() -> String {
    "monitoring.db".to_string()
}

fn default_alert_username() -> String {
    "AI Frontend Monitor".to_string()
}

fn default_dashboard_url() -> String {
    "http://localhost:3000/dashboard".to_string()
}

fn default_error_window() -> Duration {
    Duration::from_secs(60)
}

fn default_error_threshold() -> u32 {
    10
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_budget_cooldown() -> Duration {
    Duration::from_secs(10 * 60)
}

pub(crate) fn default_budgets() -> HashMap<String, f64> {
    HashMap::from([
        ("LCP".to_string(), 2500.0),
        ("CLS".to_string(), 0.1),
        ("INP".to_string(), 200.0),
    ])
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sourcemap_dir() -> PathBuf {
    PathBuf::from("uploaded-sourcemaps")
}

fn default_fallback_release() -> String {
    "1.0.0".to_string()
}

fn default_insight_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_insight_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_insight_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_insight_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_replay_capacity() -> usize {
    100
}

fn default_export_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            recent_error_limit: default_recent_error_limit(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            username: default_alert_username(),
            dashboard_url: default_dashboard_url(),
            error_window: default_error_window(),
            error_threshold: default_error_threshold(),
            dedup_capacity: default_dedup_capacity(),
            budget_cooldown: default_budget_cooldown(),
            budgets: default_budgets(),
            timeout: default_webhook_timeout(),
        }
    }
}

impl Default for SymbolicationConfig {
    fn default() -> Self {
        Self {
            sourcemap_dir: default_sourcemap_dir(),
            fallback_release: default_fallback_release(),
        }
    }
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            endpoint: default_insight_endpoint(),
            model: default_insight_model(),
            api_key_env: default_insight_key_env(),
            timeout: default_insight_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl CollectorConfig {
    /// Collector config with defaults for everything but the two required fields.
    pub fn new(app_id: impl Into<String>, ingest_url: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ingest_url: ingest_url.into(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            replay_capacity: default_replay_capacity(),
            export_timeout: default_export_timeout(),
            compression: default_compression(),
            keep_alive: true,
            headers: HashMap::new(),
            user_agent: None,
            page_url: None,
            disabled: false,
        }
    }

    /// Validate the collector configuration.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            bail!("collector app_id is required");
        }
        if self.ingest_url.is_empty() {
            bail!("collector ingest_url is required");
        }
        if self.batch_size == 0 {
            bail!("collector batch_size must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("collector flush_interval must be positive");
        }
        if self.replay_capacity == 0 {
            bail!("collector replay_capacity must be positive");
        }
        if !codec::SUPPORTED.contains(&self.compression.as_str()) {
            bail!("invalid compression type: {}", self.compression);
        }
        Ok(())
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            bail!("server.listen_addr is required");
        }
        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be positive");
        }
        if self.server.recent_error_limit == 0 {
            bail!("server.recent_error_limit must be positive");
        }

        let alerts = &self.alerts;
        if !alerts.webhook_url.is_empty()
            && !(alerts.webhook_url.starts_with("http://")
                || alerts.webhook_url.starts_with("https://"))
        {
            bail!("alerts.webhook_url must be an http(s) URL");
        }
        if alerts.error_window.is_zero() {
            bail!("alerts.error_window must be positive");
        }
        if alerts.error_threshold == 0 {
            bail!("alerts.error_threshold must be positive");
        }
        if alerts.dedup_capacity == 0 {
            bail!("alerts.dedup_capacity must be positive");
        }
        for (name, budget) in &alerts.budgets {
            if !budget.is_finite() || *budget <= 0.0 {
                bail!("alerts.budgets.{name} must be a positive number");
            }
        }

        if self.symbolication.fallback_release.is_empty() {
            bail!("symbolication.fallback_release is required");
        }

        Ok(())
    }
}

/// Normalizes ":port" shorthand to a bindable address.
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
