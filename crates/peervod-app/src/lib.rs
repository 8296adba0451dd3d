#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Application assembly: builds the service graph in dependency order,
//! owns the signal handling contract, and tears everything down in
//! reverse order on shutdown.

pub mod auth;
pub mod bootstrap;
mod error;
pub mod telemetry;

pub use error::AppError;
