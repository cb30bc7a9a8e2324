use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Calls `Engine::tick` on a fixed interval until cancelled.
pub struct TickLoop {
    engine: Arc<Engine>,
    interval: Duration,
    cancel: CancellationToken,
}

impl TickLoop {
    pub fn new(engine: Arc<Engine>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            engine,
            interval,
            cancel,
        }
    }

    /// Run the loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs_f64(), "Tick loop started");

        loop {
            match self.engine.tick().await {
                Ok(report) if report.due > 0 => {
                    debug!(due = report.due, advanced = report.advanced, "Tick finished")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Tick loop shutting down");
                    break;
                }
            }
        }
    }
}
