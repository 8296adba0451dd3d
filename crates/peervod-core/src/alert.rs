//! The alert taxonomy: the engine's sole feedback channel.
//!
//! Alerts are emitted by the engine as one strictly ordered sequence and
//! redistributed by the alert bus. Every alert names the torrent it
//! pertains to, either through a [`TorrentHandle`] or (for lifecycle edges
//! where no live handle exists) a bare [`InfoHash`].

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::bencode;
use crate::error::Error;
use crate::metadata::TorrentMetadata;
use crate::types::InfoHash;

/// An engine handle: valid from add-acknowledgement until
/// remove-acknowledgement. The `id` distinguishes generations of the same
/// infohash across add/remove cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentHandle {
    /// Torrent identity.
    pub info_hash: InfoHash,
    /// Engine-assigned generation token.
    pub id: u64,
}

impl fmt::Display for TorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.info_hash, self.id)
    }
}

/// Engine-reported torrent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TorrentState {
    /// Validating restored resume data against on-disk files.
    CheckingResumeData,
    /// Re-hashing on-disk files.
    CheckingFiles,
    /// Waiting for metadata (magnet-style fetch).
    DownloadingMetadata,
    /// Downloading payload data.
    Downloading,
    /// All wanted data downloaded.
    Finished,
    /// Complete and uploading.
    Seeding,
}

impl TorrentState {
    /// Whether the engine is still establishing what data it has.
    #[must_use]
    pub const fn is_checking(&self) -> bool {
        matches!(self, Self::CheckingResumeData | Self::CheckingFiles)
    }
}

/// Alert category bits, OR-ed into the session's alert mask.
pub mod category {
    /// Torrent lifecycle and state alerts.
    pub const STATUS: u32 = 1 << 0;
    /// Per-piece progress alerts.
    pub const PIECE_PROGRESS: u32 = 1 << 1;
    /// Disk and resume-data alerts.
    pub const STORAGE: u32 = 1 << 2;
    /// Error alerts.
    pub const ERROR: u32 = 1 << 3;
}

/// A set of alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertMask(pub u32);

impl AlertMask {
    /// The empty mask.
    pub const NONE: Self = Self(0);
    /// Every category.
    pub const ALL: Self = Self(u32::MAX);

    /// Whether every bit of `other` is present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AlertMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Discriminator for [`Alert`] variants, used in subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum AlertKind {
    AddTorrent,
    TorrentRemoved,
    MetadataReceived,
    StateChanged,
    TorrentPaused,
    TorrentResumed,
    TorrentFinished,
    TorrentError,
    ReadPiece,
    PieceFinished,
    HashFailed,
    BlockWritten,
    FileRenamed,
    StorageMoved,
    CacheFlushed,
    SaveResumeData,
    SaveResumeDataFailed,
}

impl AlertKind {
    /// The category this kind of alert is posted under.
    #[must_use]
    pub const fn category(self) -> AlertMask {
        match self {
            Self::AddTorrent
            | Self::TorrentRemoved
            | Self::MetadataReceived
            | Self::StateChanged
            | Self::TorrentPaused
            | Self::TorrentResumed
            | Self::TorrentFinished
            | Self::HashFailed => AlertMask(category::STATUS),
            Self::TorrentError => AlertMask(category::STATUS | category::ERROR),
            Self::PieceFinished | Self::BlockWritten => AlertMask(category::PIECE_PROGRESS),
            Self::ReadPiece
            | Self::FileRenamed
            | Self::StorageMoved
            | Self::CacheFlushed
            | Self::SaveResumeData
            | Self::SaveResumeDataFailed => AlertMask(category::STORAGE),
        }
    }
}

/// A typed engine event.
#[derive(Debug, Clone)]
pub enum Alert {
    /// An asynchronous add completed. On success `handle` is set; carries
    /// the metadata that was passed in, if any.
    AddTorrent {
        /// Torrent identity.
        info_hash: InfoHash,
        /// Engine handle; `None` when the add failed.
        handle: Option<TorrentHandle>,
        /// Failure reason, if the add failed.
        error: Option<Error>,
        /// Metainfo supplied with the add, if any.
        metadata: Option<Arc<TorrentMetadata>>,
    },
    /// The torrent left the session. The handle is no longer valid.
    TorrentRemoved {
        /// Torrent identity.
        info_hash: InfoHash,
        /// The now-invalid handle.
        handle: TorrentHandle,
    },
    /// Metadata became available after a magnet-style fetch.
    MetadataReceived {
        /// Torrent the metadata belongs to.
        handle: TorrentHandle,
    },
    /// Lifecycle state transition.
    StateChanged {
        /// Torrent whose state changed.
        handle: TorrentHandle,
        /// State before the transition.
        prev: TorrentState,
        /// State after the transition.
        state: TorrentState,
    },
    /// The torrent was paused.
    TorrentPaused {
        /// Paused torrent.
        handle: TorrentHandle,
    },
    /// The torrent was resumed.
    TorrentResumed {
        /// Resumed torrent.
        handle: TorrentHandle,
    },
    /// All wanted data finished downloading.
    TorrentFinished {
        /// Finished torrent.
        handle: TorrentHandle,
    },
    /// The torrent hit a terminal engine error (mostly disk errors).
    TorrentError {
        /// Failed torrent.
        handle: TorrentHandle,
        /// The error.
        error: Error,
    },
    /// Result of a `read_piece` call or an `alert_when_available` deadline.
    ReadPiece {
        /// Torrent the piece belongs to.
        handle: TorrentHandle,
        /// Piece index.
        piece: u32,
        /// Piece payload; empty when `error` is set.
        data: Arc<Vec<u8>>,
        /// Read failure, if any. A cancellation kind means the
        /// `alert_when_available` flag was cleared, not a real failure.
        error: Option<Error>,
    },
    /// A piece was downloaded and passed its hash check.
    PieceFinished {
        /// Torrent the piece belongs to.
        handle: TorrentHandle,
        /// Piece index.
        piece: u32,
    },
    /// A downloaded piece failed its hash check and was dropped.
    HashFailed {
        /// Torrent the piece belongs to.
        handle: TorrentHandle,
        /// Piece index.
        piece: u32,
    },
    /// A block was flushed to disk. Precedes the piece's hash check.
    BlockWritten {
        /// Torrent the block belongs to.
        handle: TorrentHandle,
        /// Piece the block belongs to.
        piece: u32,
    },
    /// A payload file was renamed.
    FileRenamed {
        /// Affected torrent.
        handle: TorrentHandle,
    },
    /// The torrent's storage moved to a new path.
    StorageMoved {
        /// Affected torrent.
        handle: TorrentHandle,
    },
    /// The disk cache for the torrent was flushed.
    CacheFlushed {
        /// Affected torrent.
        handle: TorrentHandle,
    },
    /// A `save_resume_data` call succeeded.
    SaveResumeData {
        /// Torrent the blob belongs to. May already be invalid if the
        /// torrent was removed between the call and this alert.
        handle: TorrentHandle,
        /// Torrent identity.
        info_hash: InfoHash,
        /// The resume blob, as a bencoded dictionary. Contains the `info`
        /// dictionary when metadata was requested and available.
        resume: bencode::Value,
        /// Full metadata, when the blob carries it.
        metadata: Option<Arc<TorrentMetadata>>,
    },
    /// A `save_resume_data` call failed (including "not modified" when
    /// `only_if_modified` was requested).
    SaveResumeDataFailed {
        /// Torrent the call was made against.
        handle: TorrentHandle,
        /// Torrent identity.
        info_hash: InfoHash,
        /// Failure reason.
        error: Error,
    },
}

impl Alert {
    /// This alert's kind discriminator.
    #[must_use]
    pub const fn kind(&self) -> AlertKind {
        match self {
            Self::AddTorrent { .. } => AlertKind::AddTorrent,
            Self::TorrentRemoved { .. } => AlertKind::TorrentRemoved,
            Self::MetadataReceived { .. } => AlertKind::MetadataReceived,
            Self::StateChanged { .. } => AlertKind::StateChanged,
            Self::TorrentPaused { .. } => AlertKind::TorrentPaused,
            Self::TorrentResumed { .. } => AlertKind::TorrentResumed,
            Self::TorrentFinished { .. } => AlertKind::TorrentFinished,
            Self::TorrentError { .. } => AlertKind::TorrentError,
            Self::ReadPiece { .. } => AlertKind::ReadPiece,
            Self::PieceFinished { .. } => AlertKind::PieceFinished,
            Self::HashFailed { .. } => AlertKind::HashFailed,
            Self::BlockWritten { .. } => AlertKind::BlockWritten,
            Self::FileRenamed { .. } => AlertKind::FileRenamed,
            Self::StorageMoved { .. } => AlertKind::StorageMoved,
            Self::CacheFlushed { .. } => AlertKind::CacheFlushed,
            Self::SaveResumeData { .. } => AlertKind::SaveResumeData,
            Self::SaveResumeDataFailed { .. } => AlertKind::SaveResumeDataFailed,
        }
    }

    /// The handle this alert pertains to, if one exists.
    #[must_use]
    pub const fn handle(&self) -> Option<TorrentHandle> {
        match self {
            Self::AddTorrent { handle, .. } => *handle,
            Self::TorrentRemoved { handle, .. }
            | Self::MetadataReceived { handle }
            | Self::StateChanged { handle, .. }
            | Self::TorrentPaused { handle }
            | Self::TorrentResumed { handle }
            | Self::TorrentFinished { handle }
            | Self::TorrentError { handle, .. }
            | Self::ReadPiece { handle, .. }
            | Self::PieceFinished { handle, .. }
            | Self::HashFailed { handle, .. }
            | Self::BlockWritten { handle, .. }
            | Self::FileRenamed { handle }
            | Self::StorageMoved { handle }
            | Self::CacheFlushed { handle }
            | Self::SaveResumeData { handle, .. }
            | Self::SaveResumeDataFailed { handle, .. } => Some(*handle),
        }
    }

    /// The infohash this alert pertains to.
    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        match self {
            Self::AddTorrent { info_hash, .. }
            | Self::TorrentRemoved { info_hash, .. }
            | Self::SaveResumeData { info_hash, .. }
            | Self::SaveResumeDataFailed { info_hash, .. } => *info_hash,
            other => other
                .handle()
                .map(|handle| handle.info_hash)
                .unwrap_or_else(|| InfoHash::new([0; 20])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_contains_and_or() {
        let status = AlertMask(category::STATUS);
        let both = status | AlertMask(category::STORAGE);
        assert!(both.contains(status));
        assert!(!status.contains(both));
        assert!(AlertMask::ALL.contains(both));
    }

    #[test]
    fn alert_kind_and_identity() {
        let handle = TorrentHandle {
            info_hash: InfoHash::new([7; 20]),
            id: 1,
        };
        let alert = Alert::PieceFinished { handle, piece: 3 };
        assert_eq!(alert.kind(), AlertKind::PieceFinished);
        assert_eq!(alert.handle(), Some(handle));
        assert_eq!(alert.info_hash(), handle.info_hash);
        assert!(
            alert
                .kind()
                .category()
                .contains(AlertMask(category::PIECE_PROGRESS))
        );
    }

    #[test]
    fn checking_states() {
        assert!(TorrentState::CheckingFiles.is_checking());
        assert!(TorrentState::CheckingResumeData.is_checking());
        assert!(!TorrentState::Downloading.is_checking());
    }
}
