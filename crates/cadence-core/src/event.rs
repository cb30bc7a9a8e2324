use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{EnrollmentId, ScenarioId, SubjectId};

/// Lifecycle events published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Enrolled {
        enrollment: EnrollmentId,
        scenario: ScenarioId,
        subject: SubjectId,
    },
    StepExecuted {
        enrollment: EnrollmentId,
        step: usize,
    },
    ActionFailed {
        enrollment: EnrollmentId,
        step: usize,
        error: String,
    },
    Completed {
        enrollment: EnrollmentId,
    },
    Exited {
        enrollment: EnrollmentId,
        reason: String,
    },
    TickComplete {
        started_at: DateTime<Utc>,
        due: usize,
        advanced: usize,
    },
}

/// Fan-out of [`EngineEvent`]s. Each subscriber sees every event published
/// after it subscribed; a slow subscriber loses the oldest events first.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Publishing with nobody listening is not an error.
    pub fn publish(&self, event: EngineEvent) {
        self.tx.send(event).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
