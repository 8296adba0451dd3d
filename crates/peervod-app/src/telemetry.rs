//! Logging setup.

use tracing_subscriber::EnvFilter;

use crate::AppError;

/// Install the global tracing subscriber: compact fmt output filtered by
/// `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// Returns [`AppError::Telemetry`] if a subscriber is already installed.
pub fn init() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| AppError::Telemetry(err.to_string()))
}

/// Like [`init`], but tolerate an already-installed subscriber. Used by
/// tests that share a process.
pub fn init_for_tests() {
    let _ = init();
}
