//! The contract between this system and the embedded BitTorrent engine.
//!
//! Everything the engine does — peer wire protocol, disk I/O, piece
//! hashing — is behind [`SessionBackend`]. Calls may block on the engine's
//! internal mutex; operations documented as blocking do disk I/O and must
//! only run on threads that may block.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::alert::{Alert, TorrentState};
use crate::bencode;
use crate::bitmap::PieceBitmap;
use crate::error::Result;
use crate::metadata::TorrentMetadata;
use crate::types::InfoHash;

pub use crate::alert::TorrentHandle;

/// Per-torrent flag bits, applied with [`SessionBackend::set_flags`].
pub mod torrent_flags {
    /// Torrent is paused.
    pub const PAUSED: u64 = 1 << 0;
    /// Engine manages pause/resume and queueing automatically.
    pub const AUTO_MANAGED: u64 = 1 << 1;
    /// Apply the session-wide IP filter to this torrent's peers.
    pub const APPLY_IP_FILTER: u64 = 1 << 2;
    /// Treat adding a duplicate infohash as an error.
    pub const DUPLICATE_IS_ERROR: u64 = 1 << 3;

    /// Flags newly-added torrents get by default.
    pub const DEFAULT: u64 = AUTO_MANAGED | APPLY_IP_FILTER;
}

/// Flag bits for [`SessionBackend::save_resume_data`].
pub mod save_flags {
    /// Only produce a blob if state changed since the last save.
    pub const ONLY_IF_MODIFIED: u8 = 1 << 0;
    /// Embed the full `info` dictionary in the blob.
    pub const SAVE_INFO_DICT: u8 = 1 << 1;
    /// Flush the disk cache before saving.
    pub const FLUSH_DISK_CACHE: u8 = 1 << 2;
}

/// How payload files are allocated on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Allocate lazily; files grow as pieces arrive.
    #[default]
    Sparse,
    /// Preallocate full file sizes at add time.
    Allocate,
}

/// A value in the engine's settings map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    /// Boolean setting.
    Bool(bool),
    /// Integer setting.
    Int(i64),
    /// String setting.
    Str(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value}"),
        }
    }
}

/// Descriptor for admitting a torrent into the engine.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    /// Torrent identity.
    pub info_hash: InfoHash,
    /// Full metainfo, when known up front. Absent for magnet-style adds.
    pub metadata: Option<Arc<TorrentMetadata>>,
    /// Directory payload files live under.
    pub save_path: PathBuf,
    /// Initial torrent flags.
    pub flags: u64,
    /// Initial per-piece priorities; empty means engine defaults.
    pub piece_priorities: Vec<u8>,
    /// Restored resume blob, if resuming from disk.
    pub resume: Option<bencode::Value>,
    /// Tracker URLs to announce to.
    pub trackers: Vec<String>,
    /// On-disk allocation strategy.
    pub storage_mode: StorageMode,
}

impl AddTorrentParams {
    /// A descriptor with default flags and no metadata.
    #[must_use]
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            metadata: None,
            save_path: PathBuf::new(),
            flags: torrent_flags::DEFAULT,
            piece_priorities: Vec::new(),
            resume: None,
            trackers: Vec::new(),
            storage_mode: StorageMode::default(),
        }
    }
}

/// Point-in-time status snapshot for one torrent.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    /// Current lifecycle state.
    pub state: TorrentState,
    /// Current flag bits.
    pub flags: u64,
    /// Verified pieces.
    pub have: PieceBitmap,
    /// Bytes of verified payload on disk.
    pub total_done: u64,
    /// Pieces the engine has fully written to disk, hashed or not.
    pub pieces_downloaded: u32,
}

/// The embedded engine.
///
/// Implementations must be callable from any thread; alert retrieval is the
/// single exception — exactly one consumer (the alert bus pump) may call
/// [`SessionBackend::wait_for_alerts`].
pub trait SessionBackend: Send + Sync {
    /// Engine version triple, for version-gated workarounds.
    fn version(&self) -> (u32, u32, u32);

    /// Apply a settings delta. Never partially fails.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if a key or value is not
    /// recognized by the engine.
    fn apply_settings(&self, delta: &BTreeMap<String, SettingValue>) -> Result<()>;

    /// Queue an asynchronous add. Resolution arrives as
    /// [`Alert::AddTorrent`]. Blocking: may do disk I/O to normalize the
    /// save path.
    ///
    /// # Errors
    ///
    /// Returns an error only if the descriptor is unusable before queuing.
    fn async_add_torrent(&self, params: AddTorrentParams) -> Result<()>;

    /// Queue an asynchronous remove; acknowledged by
    /// [`Alert::TorrentRemoved`]. Blocking: validates the handle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn remove_torrent(&self, handle: TorrentHandle, with_data: bool) -> Result<()>;

    /// Look up the live handle for an infohash. The result is synchronized
    /// with add/remove alerts: after [`Alert::TorrentRemoved`] is posted,
    /// this never returns the removed handle. Blocking.
    fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle>;

    /// All live handles. Blocking.
    fn torrent_handles(&self) -> Vec<TorrentHandle>;

    /// Pause the whole session; no further downloads or uploads.
    fn pause_session(&self);

    /// Status snapshot. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn status(&self, handle: TorrentHandle) -> Result<TorrentStatus>;

    /// The torrent's metadata, if the engine has it. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn torrent_metadata(&self, handle: TorrentHandle) -> Result<Option<Arc<TorrentMetadata>>>;

    /// Apply piece priorities (0 = skip .. 7 = highest) in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn prioritize_pieces(&self, handle: TorrentHandle, priorities: &[(u32, u8)]) -> Result<()>;

    /// Set a piece deadline in milliseconds from now, forcing priority 7.
    ///
    /// With `alert_when_available`: if the piece is already present this is
    /// equivalent to [`SessionBackend::read_piece`] (not idempotent — one
    /// [`Alert::ReadPiece`] per call); otherwise it arms the flag
    /// (idempotent). Without it: on an outstanding piece with the flag
    /// armed, the flag is cleared and a cancelled [`Alert::ReadPiece`]
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn set_piece_deadline(
        &self,
        handle: TorrentHandle,
        piece: u32,
        deadline_ms: u64,
        alert_when_available: bool,
    ) -> Result<()>;

    /// Drop a piece's deadline, resetting its priority to 1. Clears an
    /// armed `alert_when_available` flag, firing a cancelled read alert.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn reset_piece_deadline(&self, handle: TorrentHandle, piece: u32) -> Result<()>;

    /// Request a piece's bytes; answered by [`Alert::ReadPiece`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn read_piece(&self, handle: TorrentHandle, piece: u32) -> Result<()>;

    /// Update the flag bits selected by `mask` to `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn set_flags(&self, handle: TorrentHandle, flags: u64, mask: u64) -> Result<()>;

    /// Clear a torrent's error state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn clear_error(&self, handle: TorrentHandle) -> Result<()>;

    /// Drop all verified state and re-hash on-disk data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale.
    fn force_recheck(&self, handle: TorrentHandle) -> Result<()>;

    /// Ask the engine to produce a resume blob; answered by exactly one of
    /// [`Alert::SaveResumeData`] or [`Alert::SaveResumeDataFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidHandle`] if the handle is stale, in
    /// which case no alert will fire.
    fn save_resume_data(&self, handle: TorrentHandle, flags: u8) -> Result<()>;

    /// Block up to `timeout` for alerts, then drain and return everything
    /// queued. Single-consumer; see the trait docs.
    fn wait_for_alerts(&self, timeout: Duration) -> Vec<Arc<Alert>>;
}
