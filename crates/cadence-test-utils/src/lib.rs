//! Mocks and fixtures shared by the Cadence test suites.

pub mod facts;
pub mod fixtures;
pub mod mutator;
pub mod sender;

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

pub use facts::StaticFacts;
pub use mutator::{MutatorCall, RecordingMutator};
pub use sender::RecordingSender;

static INIT: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
///
/// Enable output with e.g. `RUST_LOG=cadence_engine=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
