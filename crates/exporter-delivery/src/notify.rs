//! Best-effort notifications when a batch is quarantined.
//!
//! Notification failures are logged by the caller and never change the
//! outcome of the batch.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Details of a batch moved to the failed directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantineEvent {
    pub batch_idempotency_key: String,
    pub file_name: String,
    pub record_count: usize,
    pub first_attempt: String,
    pub retry_count: u32,
    pub last_error: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned HTTP {0}")]
    Status(u16),
}

/// Receives quarantine events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &QuarantineEvent) -> Result<(), NotifyError>;
}

/// Emits an error-level log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &QuarantineEvent) -> Result<(), NotifyError> {
        error!(
            batch_key = %event.batch_idempotency_key,
            file = %event.file_name,
            records = event.record_count,
            retry_count = event.retry_count,
            first_attempt = %event.first_attempt,
            last_error = %event.last_error,
            "batch quarantined to failed directory; manual resend required"
        );
        Ok(())
    }
}

/// POSTs the event as JSON to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    #[serde(flatten)]
    details: &'a QuarantineEvent,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &QuarantineEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                event: "batch_quarantined",
                details: event,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> QuarantineEvent {
        QuarantineEvent {
            batch_idempotency_key: "abc123".to_string(),
            file_name: "spool_20251201T000000000Z_abc123.json".to_string(),
            record_count: 2,
            first_attempt: "2025-12-01T00:00:00.000Z".to_string(),
            retry_count: 10,
            last_error: "HTTP 503: unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.notify(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/exporter"))
            .and(body_partial_json(serde_json::json!({
                "event": "batch_quarantined",
                "batch_idempotency_key": "abc123",
                "retry_count": 10
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hooks/exporter", server.uri())).unwrap();
        notifier.notify(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        let err = notifier.notify(&event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
    }
}
