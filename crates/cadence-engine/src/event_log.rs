use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_core::event::EngineEvent;

/// Writes engine events to the tracing log until cancelled or the bus closes.
pub struct EventLog {
    rx: Receiver<EngineEvent>,
    cancel: CancellationToken,
}

impl EventLog {
    pub fn new(rx: Receiver<EngineEvent>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Returns the number of events logged.
    pub async fn run(mut self) -> usize {
        let mut logged = 0;
        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok(event) => {
                        record(&event);
                        logged += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log fell behind")
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        logged
    }
}

fn record(event: &EngineEvent) {
    match event {
        EngineEvent::Enrolled {
            enrollment,
            scenario,
            subject,
        } => info!(%enrollment, %scenario, %subject, "Enrolled"),
        EngineEvent::StepExecuted { enrollment, step } => {
            debug!(%enrollment, step, "Step executed")
        }
        EngineEvent::ActionFailed {
            enrollment,
            step,
            error,
        } => warn!(%enrollment, step, %error, "Action failed"),
        EngineEvent::Completed { enrollment } => info!(%enrollment, "Enrollment completed"),
        EngineEvent::Exited { enrollment, reason } => {
            info!(%enrollment, %reason, "Enrollment exited")
        }
        EngineEvent::TickComplete {
            started_at,
            due,
            advanced,
        } => debug!(%started_at, due, advanced, "Tick event"),
    }
}
