//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Verbosity variable; takes a tracing filter directive (`debug`,
/// `ensembleflow=trace`, ...)
pub const ENV_VERBOSE: &str = "RADICAL_ENTK_VERBOSE";

/// Install the global tracing subscriber
///
/// Reads the filter from [`ENV_VERBOSE`], defaulting to `info`. Calling it
/// more than once (tests, embedders with their own subscriber) is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_env(ENV_VERBOSE).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
