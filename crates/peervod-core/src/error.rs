use std::io;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds that propagate to callers.
///
/// Errors are attached to requests and surfaced on the reader's next read;
/// they are never raised asynchronously into the process. The enum is
/// `Clone` so a single terminal error can fan out to every request on a
/// torrent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Configuration rejected at load or stage time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The metainfo fetch callback failed (e.g. the tracker returned an error).
    #[error("metainfo fetch failed: {0}")]
    Fetch(String),
    /// Request or I/O cancelled by the caller, shutdown, or removal.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Specialization of [`Error::Cancelled`] when the cause is torrent removal.
    #[error("torrent removed")]
    TorrentRemoved,
    /// Disk or storage error reported by the engine.
    #[error("storage error: {0}")]
    Storage(String),
    /// Only used for the resume-store shutdown wait.
    #[error("timed out")]
    Timeout,
    /// The subscription's bounded alert queue overflowed; terminal for that
    /// subscription only.
    #[error("alert queue overflow")]
    AlertOverflow,
    /// An engine call was made against a handle the engine no longer knows.
    #[error("invalid torrent handle")]
    InvalidHandle,
    /// Malformed bencoded data.
    #[error("bencode error: {0}")]
    Bencode(String),
    /// Structurally valid bencode that is not a usable metainfo dictionary.
    #[error("invalid metainfo: {0}")]
    Metainfo(String),
}

impl Error {
    /// Whether this error is a cancellation kind (including removal).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::TorrentRemoved)
    }

    /// Shorthand for a cancellation with a static reason.
    #[must_use]
    pub fn cancelled(reason: &str) -> Self {
        Self::Cancelled(reason.to_owned())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Cancelled(_) | Error::TorrentRemoved => io::ErrorKind::ConnectionAborted,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::InvalidConfig(_) | Error::Bencode(_) | Error::Metainfo(_) => {
                io::ErrorKind::InvalidData
            }
            Error::InvalidHandle => io::ErrorKind::NotFound,
            _ => io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_covers_removal() {
        assert!(Error::cancelled("shutdown").is_cancellation());
        assert!(Error::TorrentRemoved.is_cancellation());
        assert!(!Error::Timeout.is_cancellation());
    }

    #[test]
    fn io_conversion_preserves_kind() {
        let io_err: io::Error = Error::cancelled("test").into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionAborted);
        let io_err: io::Error = Error::Timeout.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }
}
