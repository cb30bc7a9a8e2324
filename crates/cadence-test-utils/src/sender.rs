use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::MessageSender;
use cadence_core::types::{OutboundMessage, SubjectId};

/// Message sender that records every delivery.
pub struct RecordingSender {
    sent: Mutex<Vec<(SubjectId, OutboundMessage)>>,
    fail: bool,
    latency: Option<Duration>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
            latency: None,
        }
    }

    /// A sender whose every delivery fails (nothing is recorded).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// A sender that sleeps before recording, to widen race windows.
    pub fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    pub fn sent(&self) -> Vec<(SubjectId, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Text bodies delivered to one subject, in order.
    pub fn texts_for(&self, subject: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s.as_str() == subject)
            .filter_map(|(_, m)| match m {
                OutboundMessage::Text { content } => Some(content.clone()),
                OutboundMessage::Template { .. } => None,
            })
            .collect()
    }
}

impl Default for RecordingSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, subject: &SubjectId, message: &OutboundMessage) -> BoxFuture<'_, Result<()>> {
        let subject = subject.clone();
        let message = message.clone();
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            if self.fail {
                return Err(CadenceError::Delivery {
                    channel: "recording".into(),
                    message: "simulated failure".into(),
                });
            }
            self.sent.lock().unwrap().push((subject, message));
            Ok(())
        })
    }
}
