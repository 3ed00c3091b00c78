//! Structured logging setup.
//!
//! Initializes a global `tracing` subscriber from [`crate::config::LoggingConfig`].
//! Acquisition-loop events (`ProcessIteration`, overflow/underrun, state
//! transitions) are emitted through `tracing` rather than ad hoc printing, so
//! a downstream collector can correlate them against the hardware clock.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber. Safe to call once per process;
/// subsequent calls are no-ops (mirrors `tracing_subscriber`'s own guard).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt().with_env_filter(filter).with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(err) = result {
        // Already initialized elsewhere (e.g. by a test harness); not fatal.
        tracing::trace!("tracing subscriber already initialized: {err}");
    }
}
