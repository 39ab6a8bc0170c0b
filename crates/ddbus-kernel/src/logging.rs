//! Tracing subscriber setup.

use ddbus_types::BusConfig;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` overrides `default_filter`.
/// Returns false if a global subscriber was already set.
pub fn init_logging(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .is_ok()
}

/// [`init_logging`] with the filter from `config.log_filter`.
pub fn init_logging_from(config: &BusConfig) -> bool {
    init_logging(&config.log_filter)
}

/// Like [`init_logging`], emitting one JSON object per event.
pub fn init_json_logging(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .is_ok()
}
