//! Debugging suggestions for captured errors from an OpenAI-compatible
//! chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::InsightConfig;

/// Body returned when no suggestion could be produced.
pub const UNAVAILABLE: &str = "insight unavailable";

const NO_INSIGHT: &str = "No insight generated.";
const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u32 = 300;

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("no API key configured")]
    MissingKey,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Client-reported device fields carried on a stored error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDevice {
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

/// The error to explain, as shown on the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescription {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub device: Option<ErrorDevice>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ErrorDescription {
    fn browser(&self) -> &str {
        self.device
            .as_ref()
            .and_then(|d| d.browser.as_deref())
            .unwrap_or("Unknown")
    }

    fn os(&self) -> &str {
        self.device
            .as_ref()
            .and_then(|d| d.os.as_deref())
            .unwrap_or("Unknown")
    }
}

/// Produces a short explanation and fix for an error.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn explain(&self, error: &ErrorDescription) -> Result<String, InsightError>;
}

/// Builds the debugging prompt sent to the model.
pub fn build_prompt(error: &ErrorDescription) -> String {
    format!(
        "You are an expert Frontend Debugger. Analyze the following JavaScript error and provide a concise, actionable fix.\n\
         \n\
         Error Type: {error_type}\n\
         Message: {message}\n\
         Stack Trace:\n\
         {stack}\n\
         \n\
         Context:\n\
         Browser: {browser}\n\
         OS: {os}\n\
         URL: {url}\n\
         \n\
         Please provide:\n\
         1. A 1-sentence explanation of why this happened.\n\
         2. A code block showing how to fix it.",
        error_type = error.error_type.as_deref().unwrap_or("Error"),
        message = error.message.as_deref().unwrap_or(""),
        stack = error.stack.as_deref().unwrap_or("No stack trace available"),
        browser = error.browser(),
        os = error.os(),
        url = error.url.as_deref().unwrap_or("Unknown"),
    )
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAiInsight {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiInsight {
    /// Builds a client, reading the API key from the configured variable.
    pub fn from_config(cfg: &InsightConfig) -> Result<Self, InsightError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());

        if api_key.is_none() {
            tracing::warn!(env = %cfg.api_key_env, "no insight API key set, analysis disabled");
        }

        Self::new(&cfg.endpoint, &cfg.model, api_key, cfg.timeout)
    }

    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InsightError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl InsightProvider for OpenAiInsight {
    async fn explain(&self, error: &ErrorDescription) -> Result<String, InsightError> {
        let key = self.api_key.as_deref().ok_or(InsightError::MissingKey)?;

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": build_prompt(error)}],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InsightError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = resp.json().await?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| NO_INSIGHT.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;

    fn sample() -> ErrorDescription {
        serde_json::from_value(json!({
            "type": "TypeError",
            "message": "x is undefined",
            "stack": "at run (app.js:1:10)",
            "device": {"browser": "Firefox", "os": "Linux"},
            "url": "http://site/page",
            "extra": true
        }))
        .expect("description")
    }

    #[test]
    fn test_prompt_carries_context() {
        let prompt = build_prompt(&sample());
        assert!(prompt.contains("Error Type: TypeError"));
        assert!(prompt.contains("Message: x is undefined"));
        assert!(prompt.contains("at run (app.js:1:10)"));
        assert!(prompt.contains("Browser: Firefox"));
        assert!(prompt.contains("OS: Linux"));
        assert!(prompt.contains("URL: http://site/page"));
    }

    #[test]
    fn test_prompt_defaults() {
        let prompt = build_prompt(&ErrorDescription::default());
        assert!(prompt.contains("No stack trace available"));
        assert!(prompt.contains("Browser: Unknown"));
        assert!(prompt.contains("URL: Unknown"));
    }

    #[tokio::test]
    async fn test_missing_key_is_error() {
        let insight = OpenAiInsight::new("http://127.0.0.1:9/", "m", None, Duration::from_secs(1))
            .expect("client");
        assert!(matches!(
            insight.explain(&sample()).await,
            Err(InsightError::MissingKey)
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/v1/chat/completions")
    }

    #[tokio::test]
    async fn test_explain_reads_first_choice() {
        let seen: Arc<Mutex<Option<(String, Value)>>> = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let seen = seen_in.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *seen.lock() = Some((auth, body));
                    Json(json!({"choices": [{"message": {"content": "Check for undefined."}}]}))
                }
            }),
        );
        let url = serve(router).await;

        let insight = OpenAiInsight::new(url, "gpt-test", Some("k1".to_string()), Duration::from_secs(5))
            .expect("client");
        let text = insight.explain(&sample()).await.expect("explain");
        assert_eq!(text, "Check for undefined.");

        let (auth, body) = seen.lock().clone().expect("request seen");
        assert_eq!(auth, "Bearer k1");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["max_tokens"], 300);
        assert!(body["messages"][0]["content"]
            .as_str()
            .expect("content")
            .contains("TypeError"));
    }

    #[tokio::test]
    async fn test_explain_empty_choices_and_errors() {
        let router = Router::new()
            .route("/v1/chat/completions", post(|| async { Json(json!({"choices": []})) }))
            .route(
                "/fail",
                post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            );
        let url = serve(router).await;

        let ok = OpenAiInsight::new(url.clone(), "m", Some("k".to_string()), Duration::from_secs(5))
            .expect("client");
        assert_eq!(ok.explain(&sample()).await.expect("explain"), NO_INSIGHT);

        let fail_url = url.replace("/v1/chat/completions", "/fail");
        let fail = OpenAiInsight::new(fail_url, "m", Some("k".to_string()), Duration::from_secs(5))
            .expect("client");
        match fail.explain(&sample()).await {
            Err(InsightError::Status { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
