use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Delivery channel for rendered alert messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    content: &'a str,
    username: &'a str,
}

/// Chat-style webhook (Discord/Slack compatible `{content, username}` body).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            username: username.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookBody {
                content: message,
                username: &self.username,
            })
            .send()
            .await?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Keeps every message in memory instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_body_shape() {
        let body = serde_json::to_value(WebhookBody {
            content: "hi",
            username: "AI Frontend Monitor",
        })
        .expect("serialize");
        assert_eq!(body, serde_json::json!({"content": "hi", "username": "AI Frontend Monitor"}));
    }

    #[tokio::test]
    async fn test_recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify("a").await.expect("notify");
        notifier.notify("b").await.expect("notify");
        assert_eq!(notifier.messages(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_webhook_to_closed_port_is_http_error() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/hook",
            "test",
            Duration::from_millis(500),
        )
        .expect("client");
        assert!(matches!(notifier.notify("x").await, Err(NotifyError::Http(_))));
    }
}
