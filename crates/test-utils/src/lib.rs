//! Shared fixtures for the `hpctest` integration tests: config builders, a
//! scripted job backend, a scripted scheduler command runner, and a harness
//! that runs a whole suite against them.

pub mod builders;
pub mod fake_backend;
pub mod fake_runner;
pub mod harness;

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Directives for test logging. Falls back to `warn` so passing runs stay
/// quiet; captured output only shows for failures anyway.
pub const TEST_LOG_ENV: &str = "HPCTEST_TEST_LOG";

/// Upper bound for a single scenario. Fake backend polls every few
/// milliseconds, so anything near this is a hang.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: OnceLock<()> = OnceLock::new();

pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = std::env::var(TEST_LOG_ENV)
            .ok()
            .and_then(|d| EnvFilter::try_new(d).ok())
            .unwrap_or_else(|| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(SCENARIO_TIMEOUT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("scenario still running after {SCENARIO_TIMEOUT:?}"),
    }
}
