//! Tracing bootstrap for embedding daemons and tests.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. Safe to call more than once; later
/// calls are no-ops. `filter` falls back to `RUST_LOG`, then `"info"`.
pub fn init(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
