//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initialize stdout logging.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` (e.g. "info",
/// "incident_metrics=debug") is used as the filter directive.
pub fn init_logging(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}
