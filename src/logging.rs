//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config;

/// Install a `fmt` subscriber filtered by `TOUCH_VISION_LOG` (or `RUST_LOG`).
///
/// Safe to call more than once; only the first call installs anything.
/// Logs go to stderr so `--json` output on stdout stays parseable.
pub fn init() {
    init_with(&config::log_filter());
}

/// Install a subscriber with an explicit filter directive (e.g. "touch_vision=debug")
pub fn init_with(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
