#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! The on-demand torrent I/O engine.
//!
//! Turns an open-for-reading byte range into a scheduled, prioritized,
//! cancellable, sequentially-served stream of piece data sourced from the
//! embedded engine. One torrent entry per infohash reconciles desired
//! state against the engine through a single idempotent `sync()` step;
//! [`TorrentReader`] adapts requests into a buffered, seekable byte
//! stream.

mod chunk;
mod engine;
mod entry;
mod reader;
mod request;

pub use chunk::Chunk;
pub use engine::RequestEngine;
pub use reader::TorrentReader;
pub use request::{MetainfoFetcher, MetainfoSource, Request, RequestMode, RequestParams};

/// Default request priority.
pub const DEFAULT_REQUEST_PRIORITY: u32 = 1_000;

/// Milliseconds between consecutive deadline slots. Spacing the deadlines
/// keeps the advancement of wall-clock time from reordering the queue
/// between calls.
pub(crate) const DEADLINE_GAP_MS: u64 = 10_000;
