//! Message senders for outbound delivery.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use cadence_core::config::DeliveryConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::MessageSender;
use cadence_core::types::{OutboundMessage, SubjectId};

/// Sender that only logs messages. Used when no webhook is configured.
pub struct LogSender;

impl MessageSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, subject: &SubjectId, message: &OutboundMessage) -> BoxFuture<'_, Result<()>> {
        match message {
            OutboundMessage::Text { content } => {
                info!(subject = %subject, chars = content.chars().count(), "Outbound text")
            }
            OutboundMessage::Template { template_id } => {
                info!(subject = %subject, template = %template_id, "Outbound template")
            }
        }
        Box::pin(async { Ok(()) })
    }
}

/// Sender that POSTs each message as JSON to a webhook.
pub struct WebhookSender {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| delivery_error(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            token,
        })
    }

    /// Build from config; `None` when no webhook URL is set.
    pub fn from_config(config: &DeliveryConfig) -> Result<Option<Self>> {
        match &config.webhook_url {
            Some(url) if !url.trim().is_empty() => Ok(Some(Self::new(
                url.trim(),
                config.token.clone(),
                Duration::from_secs(config.timeout_secs),
            )?)),
            _ => Ok(None),
        }
    }
}

/// JSON body sent to the webhook.
pub fn webhook_payload(subject: &SubjectId, message: &OutboundMessage) -> serde_json::Value {
    json!({
        "subject": subject.as_str(),
        "message": message,
    })
}

impl MessageSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, subject: &SubjectId, message: &OutboundMessage) -> BoxFuture<'_, Result<()>> {
        let body = webhook_payload(subject, message);
        Box::pin(async move {
            let mut req = self.http.post(&self.url).json(&body);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| delivery_error(format!("Request failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(delivery_error(format!(
                    "Webhook returned {}: {}",
                    status,
                    text.chars().take(200).collect::<String>()
                )));
            }
            Ok(())
        })
    }
}

fn delivery_error(message: String) -> CadenceError {
    CadenceError::Delivery {
        channel: "webhook".into(),
        message,
    }
}
