//! Shared helpers for the test suites.

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process.
///
/// Tests that debug scheduling or recovery behavior can be run with
/// `RUST_LOG=airlog=trace` to watch the pipeline think.
pub(crate) fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

    let _ = registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
