#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Engine-agnostic types shared across the workspace: torrent identity and
//! metadata, piece arithmetic, the alert taxonomy, and the [`SessionBackend`]
//! contract implemented by the embedded BitTorrent engine.

pub mod alert;
pub mod backend;
pub mod bencode;
pub mod bitmap;
mod error;
mod metadata;
mod types;

pub use alert::{Alert, AlertKind, AlertMask, TorrentState, category};
pub use backend::{
    AddTorrentParams, SessionBackend, SettingValue, StorageMode, TorrentHandle, TorrentStatus,
    save_flags, torrent_flags,
};
pub use bitmap::{PieceBitmap, piecewise_ranges, range_to_pieces};
pub use error::{Error, Result};
pub use metadata::{FileEntry, TorrentMetadata};
pub use types::{InfoHash, TorrentSlice};
