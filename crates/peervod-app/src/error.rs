/// Top-level application failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration was rejected at startup. Startup config errors abort
    /// the process; reload errors only log.
    #[error("configuration error: {0}")]
    Config(#[from] peervod_core::Error),
    /// Telemetry could not be initialized.
    #[error("telemetry init failed: {0}")]
    Telemetry(String),
    /// Filesystem problem while preparing the config directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
