#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Binary entrypoint: wires the services together and blocks until
//! shutdown.

use std::path::PathBuf;

use peervod_app::bootstrap;

#[tokio::main]
async fn main() -> Result<(), peervod_app::AppError> {
    let config_dir = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PEERVOD_CONFIG_DIR").ok())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    bootstrap::run_app(&config_dir).await
}
