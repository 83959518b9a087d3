//! Real-time alerting on the ingested event stream.
//!
//! Three rules run against every event: an error-rate threshold inside a
//! fixed window, first sighting of an error fingerprint, and per-vital
//! performance budgets with a cooldown. All state lives in memory and is
//! lost on restart.

pub mod notifier;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::clock::{duration_ms, SharedClock};
use crate::config::AlertsConfig;
use crate::event::{nested_str, Event, EventType};
use crate::server::health::HealthMetrics;

pub use notifier::{Notifier, NotifyError, RecordingNotifier, WebhookNotifier};

/// A decision produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// The window's error count reached the threshold.
    HighErrorRate { count: u32, window_secs: u64 },
    /// An error fingerprint not seen since the dedup set was last cleared.
    NewError {
        error_type: String,
        message: String,
        browser: String,
    },
    /// A vital exceeded its budget outside the cooldown.
    BudgetExceeded {
        metric: String,
        value: f64,
        budget: f64,
    },
}

impl Alert {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HighErrorRate { .. } => "high_error_rate",
            Self::NewError { .. } => "new_error",
            Self::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    /// Markdown message body.
    pub fn render(&self, dashboard_url: &str) -> String {
        match self {
            Self::HighErrorRate { count, window_secs } => {
                let span = if *window_secs == 60 {
                    "the last minute".to_string()
                } else {
                    format!("the last {window_secs} seconds")
                };
                format!("🚨 **High Error Rate Alert**: {count} errors detected in {span}.")
            }
            Self::NewError {
                error_type,
                message,
                browser,
            } => format!(
                "🔥 **New Error Detected**\n**Type**: {error_type}\n**Message**: {message}\n**Browser**: {browser}\n**Link**: {dashboard_url}"
            ),
            Self::BudgetExceeded {
                metric,
                value,
                budget,
            } => format!(
                "📉 **Performance Budget Exceeded**\n**Metric**: {metric}\n**Value**: {value:.2} (Budget: {budget})\n**Link**: {dashboard_url}"
            ),
        }
    }
}

/// Thresholds the engine applies.
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub window_ms: i64,
    pub error_threshold: u32,
    pub dedup_capacity: usize,
    pub budget_cooldown_ms: i64,
    pub budgets: HashMap<String, f64>,
}

impl From<&AlertsConfig> for AlertPolicy {
    fn from(cfg: &AlertsConfig) -> Self {
        Self {
            window_ms: duration_ms(cfg.error_window),
            error_threshold: cfg.error_threshold,
            dedup_capacity: cfg.dedup_capacity,
            budget_cooldown_ms: duration_ms(cfg.budget_cooldown),
            budgets: cfg.budgets.clone(),
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from(&AlertsConfig::default())
    }
}

/// Mutable alerting state, guarded by the engine's mutex.
#[derive(Debug, Default)]
pub struct AlertState {
    fingerprints: HashSet<String>,
    last_budget_alert: HashMap<String, i64>,
    window_count: u32,
    window_start: i64,
}

impl AlertState {
    fn new(now_ms: i64) -> Self {
        Self {
            window_start: now_ms,
            ..Self::default()
        }
    }

    /// Errors counted in the current window.
    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    /// Fingerprints currently remembered.
    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len()
    }
}

/// Applies the alert rules and hands alerts to a notifier.
pub struct AlertEngine {
    policy: AlertPolicy,
    state: Mutex<AlertState>,
    clock: SharedClock,
    notifier: Option<Arc<dyn Notifier>>,
    dashboard_url: String,
    metrics: Option<Arc<HealthMetrics>>,
}

impl AlertEngine {
    /// Creates an engine. Without a notifier the engine never alerts.
    pub fn new(
        policy: AlertPolicy,
        clock: SharedClock,
        notifier: Option<Arc<dyn Notifier>>,
        dashboard_url: impl Into<String>,
    ) -> Self {
        let state = AlertState::new(clock.now_ms());
        Self {
            policy,
            state: Mutex::new(state),
            clock,
            notifier,
            dashboard_url: dashboard_url.into(),
            metrics: None,
        }
    }

    /// Records sent/failed deliveries on the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Runs `f` against the current state.
    pub fn inspect<R>(&self, f: impl FnOnce(&AlertState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Evaluates one ingested event against every rule.
    pub fn observe(&self, event: &Event) -> Vec<Alert> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let mut alerts = Vec::new();
        let mut state = self.state.lock();

        if now - state.window_start > self.policy.window_ms {
            state.window_start = now;
            state.window_count = 0;
        }

        match event.event_type {
            EventType::Error => self.observe_error(&mut state, event, &mut alerts),
            EventType::Vital => self.observe_vital(&mut state, event, now, &mut alerts),
            EventType::Navigation | EventType::Unknown => {}
        }

        alerts
    }

    fn observe_error(&self, state: &mut AlertState, event: &Event, alerts: &mut Vec<Alert>) {
        state.window_count = state.window_count.saturating_add(1);
        if state.window_count == self.policy.error_threshold {
            alerts.push(Alert::HighErrorRate {
                count: state.window_count,
                window_secs: u64::try_from(self.policy.window_ms / 1000).unwrap_or(0),
            });
        }

        let error_type = event
            .payload_str("type")
            .filter(|t| !t.is_empty())
            .unwrap_or("error");
        let message = event.payload_str("message").unwrap_or_default();
        let fingerprint = format!("{error_type}:{message}");

        if state.fingerprints.insert(fingerprint) {
            if state.fingerprints.len() > self.policy.dedup_capacity {
                state.fingerprints.clear();
            }
            alerts.push(Alert::NewError {
                error_type: error_type.to_string(),
                message: message.to_string(),
                browser: nested_str(&event.payload, "device", "browser")
                    .unwrap_or("Unknown")
                    .to_string(),
            });
        }
    }

    fn observe_vital(&self, state: &mut AlertState, event: &Event, now: i64, alerts: &mut Vec<Alert>) {
        let Some(name) = event.payload_str("name") else {
            return;
        };
        let Some(value) = event.payload.get("value").and_then(Value::as_f64) else {
            return;
        };
        let Some(&budget) = self.policy.budgets.get(name) else {
            return;
        };
        if value <= budget {
            return;
        }

        let cooled_down = state
            .last_budget_alert
            .get(name)
            .map_or(true, |last| now - last > self.policy.budget_cooldown_ms);
        if !cooled_down {
            return;
        }

        state.last_budget_alert.insert(name.to_string(), now);
        alerts.push(Alert::BudgetExceeded {
            metric: name.to_string(),
            value,
            budget,
        });
    }

    /// Sends each alert on its own task. Failures are logged, never retried.
    pub fn dispatch(&self, alerts: Vec<Alert>) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        for alert in alerts {
            let notifier = Arc::clone(notifier);
            let metrics = self.metrics.clone();
            let message = alert.render(&self.dashboard_url);
            let kind = alert.kind();

            tokio::spawn(async move {
                match notifier.notify(&message).await {
                    Ok(()) => {
                        tracing::info!(kind, "alert sent");
                        if let Some(m) = &metrics {
                            m.alerts_sent.with_label_values(&[kind]).inc();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(kind, error = %e, "failed to send alert");
                        if let Some(m) = &metrics {
                            m.alerts_failed.with_label_values(&[kind]).inc();
                        }
                    }
                }
            });
        }
    }
}
