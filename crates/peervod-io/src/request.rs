use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use peervod_core::{Error, InfoHash, PieceBitmap, Result, TorrentSlice, range_to_pieces};
use tracing::warn;

use crate::DEFAULT_REQUEST_PRIORITY;
use crate::chunk::Chunk;
use crate::engine::EngineShared;

/// What the caller wants from a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// Serve the bytes back to a reader, urgently and in order.
    Read,
    /// Download urgently for an imminent read, but do not serve bytes.
    Readahead,
    /// Download opportunistically; never delay reads or readahead.
    Fill,
}

/// Callback producing a bencoded `.torrent` file for a torrent, typically
/// by asking a tracker. May block.
pub type MetainfoFetcher = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

/// Where the engine gets metadata for a torrent it has not seen.
#[derive(Clone)]
pub enum MetainfoSource {
    /// Fetch a full `.torrent` file up front.
    Metainfo(MetainfoFetcher),
    /// Add by infohash and rely on the engine's magnet-style fetch.
    Magnet {
        /// Trackers to announce to while fetching.
        trackers: Vec<String>,
    },
}

impl fmt::Debug for MetainfoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metainfo(_) => f.write_str("MetainfoSource::Metainfo(..)"),
            Self::Magnet { trackers } => f
                .debug_struct("MetainfoSource::Magnet")
                .field("trackers", trackers)
                .finish(),
        }
    }
}

/// Parameters for a new request.
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// The byte range wanted.
    pub slice: TorrentSlice,
    /// Scheduling mode.
    pub mode: RequestMode,
    /// User the download is attributed to.
    pub user: String,
    /// Tracker the torrent was resolved through, for accounting.
    pub tracker: Option<String>,
    /// How to obtain metadata if the torrent is not in the session.
    pub source: MetainfoSource,
    /// Accounting tie-break priority; higher wins.
    pub priority: u32,
}

impl RequestParams {
    /// Parameters with the default priority and no tracker attribution.
    ///
    /// # Panics
    ///
    /// Panics on a zero-length slice; empty requests are meaningless.
    #[must_use]
    pub fn new(
        slice: TorrentSlice,
        mode: RequestMode,
        user: impl Into<String>,
        source: MetainfoSource,
    ) -> Self {
        assert!(!slice.is_empty(), "zero-length request");
        Self {
            slice,
            mode,
            user: user.into(),
            tracker: None,
            source,
            priority: DEFAULT_REQUEST_PRIORITY,
        }
    }

    /// Attribute downloads to a tracker.
    #[must_use]
    pub fn tracker(mut self, tracker: impl Into<String>) -> Self {
        self.tracker = Some(tracker.into());
        self
    }

    /// Override the accounting priority.
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

pub(crate) struct RequestShared {
    pub(crate) params: RequestParams,
    pub(crate) created_seq: u64,
    pub(crate) created_at: SystemTime,
    state: Mutex<ReqState>,
    cond: Condvar,
}

struct ReqState {
    pieces: Option<(u32, u32)>,
    chunks: BTreeMap<u64, Chunk>,
    fed: HashSet<u64>,
    read_cursor: u64,
    have_set: HashSet<u32>,
    error: Option<Error>,
    deactivated_at: Option<SystemTime>,
}

impl RequestShared {
    pub(crate) fn new(params: RequestParams, created_seq: u64) -> Arc<Self> {
        let read_cursor = params.slice.start;
        Arc::new(Self {
            params,
            created_seq,
            created_at: SystemTime::now(),
            state: Mutex::new(ReqState {
                pieces: None,
                chunks: BTreeMap::new(),
                fed: HashSet::new(),
                read_cursor,
                have_set: HashSet::new(),
                error: None,
                deactivated_at: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn info_hash(&self) -> InfoHash {
        self.params.slice.info_hash
    }

    /// Record the covered piece range once metadata is known. Idempotent.
    pub(crate) fn set_piece_range(&self, piece_length: u64) {
        let mut state = self.lock();
        if state.pieces.is_none() {
            state.pieces = Some(range_to_pieces(
                piece_length,
                self.params.slice.start,
                self.params.slice.stop,
            ));
        }
    }

    pub(crate) fn piece_range(&self) -> Option<(u32, u32)> {
        self.lock().pieces
    }

    pub(crate) fn intersects(&self, piece: u32) -> bool {
        self.lock()
            .pieces
            .is_some_and(|(start, stop)| piece >= start && piece < stop)
    }

    /// Mark a piece as downloaded for this request.
    pub(crate) fn mark_piece(&self, piece: u32) {
        let mut state = self.lock();
        if state
            .pieces
            .is_some_and(|(start, stop)| piece >= start && piece < stop)
        {
            state.have_set.insert(piece);
        }
    }

    /// Mark every already-downloaded piece in one pass.
    pub(crate) fn mark_have(&self, have: &PieceBitmap) {
        let mut state = self.lock();
        let Some((start, stop)) = state.pieces else {
            return;
        };
        for piece in start..stop {
            if have.get(piece) {
                state.have_set.insert(piece);
            }
        }
    }

    /// Whether every covered piece has been downloaded.
    pub(crate) fn covered(&self) -> bool {
        let state = self.lock();
        state
            .pieces
            .is_some_and(|(start, stop)| (start..stop).all(|piece| state.have_set.contains(&piece)))
    }

    /// Attach the first terminal error and wake any waiting reader.
    pub(crate) fn set_error(&self, error: Error) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    pub(crate) fn deactivate(&self) {
        let mut state = self.lock();
        if state.deactivated_at.is_none() {
            state.deactivated_at = Some(SystemTime::now());
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().deactivated_at.is_none()
    }

    /// Deliver one piece's payload. `offset` is the piece's absolute offset
    /// in the torrent; the chunk is clamped to the request's range and
    /// duplicate deliveries are dropped.
    pub(crate) fn feed_chunk(&self, offset: u64, data: &Arc<Vec<u8>>) {
        let slice = self.params.slice;
        let clamp_start = offset.max(slice.start);
        let clamp_stop = (offset + data.len() as u64).min(slice.stop);
        if clamp_start >= clamp_stop {
            return;
        }
        let chunk = Chunk::new(
            Arc::clone(data),
            (clamp_start - offset) as usize,
            (clamp_stop - offset) as usize,
        );

        let mut state = self.lock();
        if !state.fed.insert(clamp_start) {
            if let Some(existing) = state.chunks.get(&clamp_start)
                && existing.len() != chunk.len()
            {
                warn!(
                    offset = clamp_start,
                    new = chunk.len(),
                    old = existing.len(),
                    "dropping duplicate chunk of a different size"
                );
            }
            return;
        }
        state.chunks.insert(clamp_start, chunk);
        drop(state);
        self.cond.notify_all();
    }

    /// Whether the reader has not yet consumed the whole range.
    pub(crate) fn has_next(&self) -> bool {
        self.lock().read_cursor < self.params.slice.stop
    }

    pub(crate) fn read_cursor(&self) -> u64 {
        self.lock().read_cursor
    }

    /// Block for the next in-order chunk.
    ///
    /// Returns `Ok(None)` if `timeout` elapsed with nothing to deliver; an
    /// empty chunk once the whole range has been consumed.
    pub(crate) fn next_chunk(&self, timeout: Option<Duration>) -> Result<Option<Chunk>> {
        let deadline = timeout.map(|timeout| std::time::Instant::now() + timeout);
        let mut state = self.lock();
        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.read_cursor >= self.params.slice.stop {
                return Ok(Some(Chunk::empty()));
            }
            let read_cursor = state.read_cursor;
            if let Some(chunk) = state.chunks.remove(&read_cursor) {
                state.read_cursor += chunk.len() as u64;
                return Ok(Some(chunk));
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let (state, _) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state
                }
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReqState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A caller's handle to an outstanding request.
///
/// Dropping the handle does not cancel the request; call
/// [`Request::cancel`] to stop it early.
#[derive(Clone)]
pub struct Request {
    pub(crate) shared: Arc<RequestShared>,
    pub(crate) engine: Weak<EngineShared>,
}

impl Request {
    /// The torrent this request reads from.
    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash()
    }

    /// The request's mode.
    #[must_use]
    pub fn mode(&self) -> RequestMode {
        self.shared.params.mode
    }

    /// Whether unread bytes remain (READ mode).
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.shared.has_next()
    }

    /// The next byte offset the reader will receive.
    #[must_use]
    pub fn read_cursor(&self) -> u64 {
        self.shared.read_cursor()
    }

    /// The terminal error, if one is set.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.shared.error()
    }

    /// Whether the request is still being scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Block for the next in-order chunk; `Ok(None)` on timeout, an empty
    /// chunk at end of range.
    ///
    /// # Errors
    ///
    /// Returns the request's terminal error once one is set.
    pub fn next_chunk(&self, timeout: Option<Duration>) -> Result<Option<Chunk>> {
        self.shared.next_chunk(timeout)
    }

    /// Cancel: attaches a terminal cancellation, wakes any consumer, and
    /// drops the request from scheduling on the next sync.
    pub fn cancel(&self) {
        self.shared.set_error(Error::cancelled("request cancelled"));
        if let Some(engine) = self.engine.upgrade() {
            engine.sync_entry(self.shared.info_hash());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(start: u64, stop: u64) -> RequestParams {
        RequestParams::new(
            TorrentSlice::new(InfoHash::new([1; 20]), start, stop),
            RequestMode::Read,
            "alice",
            MetainfoSource::Magnet {
                trackers: Vec::new(),
            },
        )
    }

    #[test]
    fn chunks_are_clamped_and_reassembled_in_order() {
        let request = RequestShared::new(params(10, 50), 1);
        request.set_piece_range(16);

        // Piece 1 arrives before piece 0; both are clamped to [10, 50).
        request.feed_chunk(16, &Arc::new(vec![1_u8; 16]));
        request.feed_chunk(0, &Arc::new(vec![0_u8; 16]));
        request.feed_chunk(32, &Arc::new(vec![2_u8; 16]));

        let first = request.next_chunk(None).unwrap().unwrap();
        assert_eq!(first.as_slice(), &[0_u8; 6][..]);
        let second = request.next_chunk(None).unwrap().unwrap();
        assert_eq!(second.len(), 16);
        let third = request.next_chunk(None).unwrap().unwrap();
        assert_eq!(third.len(), 16);
        assert_eq!(request.read_cursor(), 48);
        assert!(request.has_next());
    }

    #[test]
    fn duplicate_chunks_are_dropped() {
        let request = RequestShared::new(params(0, 16), 1);
        request.feed_chunk(0, &Arc::new(vec![7_u8; 16]));
        request.feed_chunk(0, &Arc::new(vec![9_u8; 16]));
        let chunk = request.next_chunk(None).unwrap().unwrap();
        assert_eq!(chunk.as_slice()[0], 7);
    }

    #[test]
    fn timeout_returns_none_and_error_wins() {
        let request = RequestShared::new(params(0, 16), 1);
        assert!(
            request
                .next_chunk(Some(Duration::from_millis(10)))
                .unwrap()
                .is_none()
        );
        request.set_error(Error::cancelled("test"));
        assert!(matches!(
            request.next_chunk(None),
            Err(Error::Cancelled(_))
        ));
    }

    #[test]
    fn coverage_tracks_marked_pieces() {
        let request = RequestShared::new(params(10, 50), 1);
        request.set_piece_range(16);
        assert_eq!(request.piece_range(), Some((0, 4)));
        assert!(!request.covered());
        for piece in 0..4 {
            request.mark_piece(piece);
        }
        assert!(request.covered());
        assert!(!request.intersects(4));
        assert!(request.intersects(2));
    }
}
