//! Per-infohash state and the `sync()` reconciliation step.
//!
//! `sync()` is the single function that reconciles desired state with
//! engine state. It is idempotent; every mutating path runs it last, and
//! every alert handler ends in it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use peervod_core::{
    AddTorrentParams, Alert, Error, InfoHash, PieceBitmap, TorrentHandle, TorrentMetadata,
    TorrentState, torrent_flags,
};
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::DEADLINE_GAP_MS;
use crate::engine::EngineShared;
use crate::request::{MetainfoSource, RequestMode, RequestShared};

/// Engine actions with at most one instance outstanding per torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Action {
    Fetch,
    Add,
    Remove,
    Pause,
}

pub(crate) struct TorrentEntry {
    pub(crate) info_hash: InfoHash,
    pub(crate) state: Mutex<EntryState>,
}

impl TorrentEntry {
    pub(crate) fn new(info_hash: InfoHash) -> Arc<Self> {
        Arc::new(Self {
            info_hash,
            state: Mutex::new(EntryState::new()),
        })
    }
}

pub(crate) struct EntryState {
    /// Set when the entry has been removed from the parent map; a stale
    /// `Arc` must not be used for new requests.
    pub(crate) dead: bool,
    pub(crate) metadata: Option<Arc<TorrentMetadata>>,
    pub(crate) handle: Option<TorrentHandle>,
    pub(crate) atp: Option<AddTorrentParams>,
    /// The staged descriptor claims verified pieces; keep the entry until
    /// the engine has checked them.
    pub(crate) expects_data: bool,
    pub(crate) requests: Vec<Arc<RequestShared>>,
    /// Piece -> READ requests awaiting that piece's bytes. Entries drain
    /// when the piece's read alert is processed or the request errors.
    pub(crate) piece_to_readers: HashMap<u32, Vec<Arc<RequestShared>>>,
    /// Pieces with a `read_piece` in flight.
    pub(crate) piece_reading: HashSet<u32>,
    /// Pieces whose deadline currently has `alert_when_available` armed.
    pub(crate) applied_reading: HashSet<u32>,
    pub(crate) have: PieceBitmap,
    pub(crate) applied_priorities: HashMap<u32, u8>,
    pub(crate) applied_seq: HashMap<u32, u64>,
    pub(crate) torrent_state: TorrentState,
    pub(crate) flags: u64,
    pub(crate) pending: HashSet<Action>,
    pub(crate) removal_requested: bool,
    pub(crate) remove_data_requested: bool,
    pub(crate) terminal_error: Option<Error>,
    /// Pieces written to disk but not yet hashed (stuck-hash workaround).
    pub(crate) pieces_written: HashSet<u32>,
    pub(crate) fixup_changed_at: Instant,
}

impl EntryState {
    fn new() -> Self {
        Self {
            dead: false,
            metadata: None,
            handle: None,
            atp: None,
            expects_data: false,
            requests: Vec::new(),
            piece_to_readers: HashMap::new(),
            piece_reading: HashSet::new(),
            applied_reading: HashSet::new(),
            have: PieceBitmap::default(),
            applied_priorities: HashMap::new(),
            applied_seq: HashMap::new(),
            torrent_state: TorrentState::CheckingResumeData,
            flags: 0,
            pending: HashSet::new(),
            removal_requested: false,
            remove_data_requested: false,
            terminal_error: None,
            pieces_written: HashSet::new(),
            fixup_changed_at: Instant::now(),
        }
    }

    /// Whether the torrent should stay in the session.
    pub(crate) fn keep(&self) -> bool {
        // Active requests override everything, including explicit removal.
        if !self.requests.is_empty() {
            return true;
        }
        // Explicit removal overrides whether we have data.
        if self.removal_requested {
            return false;
        }
        // Data we have, expect to have, or are still checking for.
        if self.have.any_set() || self.expects_data {
            return true;
        }
        if self.handle.is_some() && self.torrent_state.is_checking() {
            return true;
        }
        false
    }

    pub(crate) fn attach_request(&mut self, request: &Arc<RequestShared>) {
        self.removal_requested = false;
        self.remove_data_requested = false;
        self.requests.push(Arc::clone(request));
        self.index_request(request);
    }

    fn index_request(&mut self, request: &Arc<RequestShared>) {
        let Some(meta) = &self.metadata else {
            return;
        };
        request.set_piece_range(meta.piece_length);
        if request.params.mode != RequestMode::Read {
            return;
        }
        let Some((start, stop)) = request.piece_range() else {
            return;
        };
        for piece in start..stop {
            let readers = self.piece_to_readers.entry(piece).or_default();
            if !readers.iter().any(|reader| Arc::ptr_eq(reader, request)) {
                readers.push(Arc::clone(request));
            }
        }
    }

    pub(crate) fn set_metadata(&mut self, metadata: Arc<TorrentMetadata>) {
        if self.metadata.is_some() {
            return;
        }
        if self.have.len() != metadata.num_pieces {
            self.have = PieceBitmap::new(metadata.num_pieces);
        }
        self.metadata = Some(metadata);
        let requests: Vec<_> = self.requests.clone();
        for request in &requests {
            self.index_request(request);
        }
    }

    /// Attach a terminal error to every request.
    pub(crate) fn fail_requests(&mut self, error: &Error) {
        for request in &self.requests {
            request.set_error(error.clone());
        }
    }

    pub(crate) fn request_removal(&mut self, remove_data: bool) {
        self.removal_requested = true;
        self.remove_data_requested = remove_data;
        self.fail_requests(&Error::cancelled("torrent removal requested"));
    }

    fn deindex_request(&mut self, request: &Arc<RequestShared>) {
        self.piece_to_readers.retain(|_, readers| {
            readers.retain(|reader| !Arc::ptr_eq(reader, request));
            !readers.is_empty()
        });
    }
}

fn engine_call(result: peervod_core::Result<()>, what: &str) {
    match result {
        Ok(()) => {}
        // A stale handle means removal is already in flight; the removed
        // alert will reconcile.
        Err(Error::InvalidHandle) => {}
        Err(err) => warn!(what, error = %err, "engine call failed"),
    }
}

/// Run the reconciliation step. Returns whether the entry should be
/// removed from the parent map.
pub(crate) fn sync(st: &mut EntryState, ctx: &Arc<EngineShared>, info_hash: InfoHash) -> bool {
    reconcile_have(st);
    cleanup(st);
    // A fresh request against an errored torrent retries it.
    if st.terminal_error.is_some()
        && !st.requests.is_empty()
        && let Some(handle) = st.handle
    {
        engine_call(ctx.backend().clear_error(handle), "clear_error");
        st.terminal_error = None;
    }
    issue_reads(st, ctx);
    update_priorities(st, ctx);
    update_flags(st, ctx);

    if st.keep() {
        if st.handle.is_none()
            && !st.pending.contains(&Action::Fetch)
            && !st.pending.contains(&Action::Add)
        {
            if st.atp.is_some() {
                maybe_add(st, ctx, info_hash);
            } else {
                maybe_fetch(st, ctx, info_hash);
            }
        }
        false
    } else if st.handle.is_some() {
        maybe_remove(st, ctx, info_hash);
        false
    } else {
        st.pending.is_empty() && st.requests.is_empty()
    }
}

/// Every request intersecting a piece we have ends up with that piece in
/// its have set, no matter how the piece appeared (download, restore, or
/// recheck).
fn reconcile_have(st: &mut EntryState) {
    if st.metadata.is_none() || !st.have.any_set() {
        return;
    }
    for request in &st.requests {
        request.mark_have(&st.have);
    }
}

/// Step 1: drop requests that errored or were fully downloaded.
fn cleanup(st: &mut EntryState) {
    let mut kept = Vec::with_capacity(st.requests.len());
    let mut errored = Vec::new();
    for request in st.requests.drain(..) {
        if request.error().is_some() {
            request.deactivate();
            errored.push(request);
        } else if request.covered() {
            // Covered requests stay indexed in piece_to_readers until their
            // read alerts deliver the remaining bytes.
            request.deactivate();
        } else {
            kept.push(request);
        }
    }
    st.requests = kept;
    for request in &errored {
        st.deindex_request(request);
    }
}

/// Step 2: read back pieces readers are waiting for.
fn issue_reads(st: &mut EntryState, ctx: &Arc<EngineShared>) {
    let Some(handle) = st.handle else {
        return;
    };
    // Reading while the torrent is checking is fine.
    let mut to_read: Vec<u32> = st
        .piece_to_readers
        .iter()
        .filter(|(piece, readers)| {
            !readers.is_empty() && st.have.get(**piece) && !st.piece_reading.contains(*piece)
        })
        .map(|(piece, _)| *piece)
        .collect();
    to_read.sort_unstable();
    for piece in to_read {
        debug!(piece, "issuing read_piece");
        engine_call(ctx.backend().read_piece(handle, piece), "read_piece");
        st.piece_reading.insert(piece);
    }
}

/// Step 3: the piece priority and deadline schedule.
///
/// READ requests interleave so each makes progress on its next needed
/// piece concurrently; READAHEAD never delays a READ; FILL never delays
/// either.
fn update_priorities(st: &mut EntryState, ctx: &Arc<EngineShared>) {
    let Some(handle) = st.handle else {
        return;
    };
    let Some(meta) = st.metadata.clone() else {
        return;
    };
    if st.torrent_state.is_checking() {
        return;
    }

    let mut want_priorities: HashMap<u32, u8> = (0..meta.num_pieces)
        .filter(|piece| !st.have.get(*piece))
        .map(|piece| (piece, 0))
        .collect();

    for request in &st.requests {
        if request.params.mode != RequestMode::Fill {
            continue;
        }
        let Some((start, stop)) = request.piece_range() else {
            continue;
        };
        for piece in start..stop {
            if !st.have.get(piece) {
                want_priorities.insert(piece, 1);
            }
        }
    }

    let mut want_seq: HashMap<u32, u64> = HashMap::new();
    let mut want_reading: HashSet<u32> = HashSet::new();
    let mut readahead_base = 0_u64;
    for request in &st.requests {
        if request.params.mode != RequestMode::Read {
            continue;
        }
        let Some((start, stop)) = request.piece_range() else {
            continue;
        };
        let mut seq = 0_u64;
        for piece in start..stop {
            if st.have.get(piece) {
                continue;
            }
            let slot = want_seq.entry(piece).or_insert(u64::MAX);
            *slot = (*slot).min(seq);
            want_reading.insert(piece);
            want_priorities.insert(piece, 7);
            readahead_base = readahead_base.max(seq + 1);
            seq += 1;
        }
    }
    for request in &st.requests {
        if request.params.mode != RequestMode::Readahead {
            continue;
        }
        let Some((start, stop)) = request.piece_range() else {
            continue;
        };
        let mut seq = 0_u64;
        for piece in start..stop {
            if st.have.get(piece) {
                continue;
            }
            let slot = want_seq.entry(piece).or_insert(u64::MAX);
            *slot = (*slot).min(readahead_base + seq);
            want_priorities.insert(piece, 7);
            seq += 1;
        }
    }

    // Deadlines are milliseconds from "now" at call time, so when any slot
    // changes every affected deadline is re-issued to preserve relative
    // order. Equal slots are applied in random order to avoid bias.
    if want_seq != st.applied_seq || want_reading != st.applied_reading {
        let mut update: Vec<u32> = want_seq
            .keys()
            .chain(st.applied_seq.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        update.shuffle(&mut rand::rng());
        st.applied_seq = want_seq.clone();
        st.applied_reading = want_reading.clone();
        for piece in update {
            match want_seq.get(&piece) {
                Some(slot) => {
                    let alert_when = want_reading.contains(&piece);
                    debug!(piece, slot, alert_when, "set_piece_deadline");
                    engine_call(
                        ctx.backend().set_piece_deadline(
                            handle,
                            piece,
                            slot * DEADLINE_GAP_MS,
                            alert_when,
                        ),
                        "set_piece_deadline",
                    );
                }
                None => {
                    debug!(piece, "reset_piece_deadline");
                    engine_call(
                        ctx.backend().reset_piece_deadline(handle, piece),
                        "reset_piece_deadline",
                    );
                }
            }
        }
    }

    if want_priorities != st.applied_priorities {
        let mut batch: Vec<(u32, u8)> = want_priorities
            .iter()
            .map(|(piece, priority)| (*piece, *priority))
            .collect();
        batch.sort_unstable();
        engine_call(
            ctx.backend().prioritize_pieces(handle, &batch),
            "prioritize_pieces",
        );
        st.applied_priorities = want_priorities;
    }
}

/// Step 4: keep kept torrents auto-managed; gracefully pause the rest.
fn update_flags(st: &mut EntryState, ctx: &Arc<EngineShared>) {
    let Some(handle) = st.handle else {
        return;
    };
    if st.keep() {
        if st.flags & torrent_flags::AUTO_MANAGED == 0 {
            debug!("setting auto_managed");
            engine_call(
                ctx.backend().set_flags(
                    handle,
                    torrent_flags::AUTO_MANAGED,
                    torrent_flags::AUTO_MANAGED,
                ),
                "set_flags",
            );
            st.flags |= torrent_flags::AUTO_MANAGED;
        }
    } else if st.flags & torrent_flags::PAUSED == 0 && !st.pending.contains(&Action::Pause) {
        debug!("gracefully pausing");
        st.pending.insert(Action::Pause);
        engine_call(
            ctx.backend().set_flags(
                handle,
                torrent_flags::PAUSED,
                torrent_flags::PAUSED | torrent_flags::AUTO_MANAGED,
            ),
            "set_flags",
        );
        // The paused bit lands when the paused alert arrives.
        st.flags &= !torrent_flags::AUTO_MANAGED;
    }
}

fn maybe_add(st: &mut EntryState, ctx: &Arc<EngineShared>, info_hash: InfoHash) {
    let Some(atp) = st.atp.clone() else {
        return;
    };
    debug!(%info_hash, "adding torrent");
    st.pending.insert(Action::Add);
    if let Err(err) = ctx.backend().async_add_torrent(atp) {
        st.pending.remove(&Action::Add);
        warn!(%info_hash, error = %err, "async add failed");
        st.fail_requests(&err);
    }
}

fn maybe_fetch(st: &mut EntryState, ctx: &Arc<EngineShared>, info_hash: InfoHash) {
    // Prefer the same request accounting would blame.
    let Some(request) = pick_blame(&st.requests).cloned() else {
        return;
    };
    match &request.params.source {
        MetainfoSource::Metainfo(fetcher) => {
            debug!(%info_hash, "fetching metainfo");
            st.pending.insert(Action::Fetch);
            ctx.spawn_fetch(info_hash, Arc::clone(fetcher));
        }
        MetainfoSource::Magnet { trackers } => {
            let mut atp = ctx.build_atp(info_hash, None);
            atp.trackers.clone_from(trackers);
            st.atp = Some(atp);
            maybe_add(st, ctx, info_hash);
        }
    }
}

fn maybe_remove(st: &mut EntryState, ctx: &Arc<EngineShared>, info_hash: InfoHash) {
    if !st.pending.is_empty() {
        return;
    }
    let Some(handle) = st.handle.take() else {
        return;
    };
    debug!(%info_hash, "removing torrent");
    st.pending.insert(Action::Remove);
    st.atp = None;
    st.expects_data = false;
    match ctx
        .backend()
        .remove_torrent(handle, st.remove_data_requested)
    {
        Ok(()) => {}
        Err(Error::InvalidHandle) => {
            // Already gone; nothing to wait for.
            st.pending.remove(&Action::Remove);
        }
        Err(err) => {
            st.pending.remove(&Action::Remove);
            warn!(%info_hash, error = %err, "remove failed");
        }
    }
}

/// Accounting tie-break: active first, READ before READAHEAD before FILL,
/// then highest priority, newest creation, random.
pub(crate) fn pick_blame(requests: &[Arc<RequestShared>]) -> Option<&Arc<RequestShared>> {
    requests.iter().min_by_key(|request| {
        (
            !request.is_active(),
            request.params.mode != RequestMode::Read,
            request.params.mode != RequestMode::Readahead,
            request.params.mode != RequestMode::Fill,
            std::cmp::Reverse(request.params.priority),
            std::cmp::Reverse(request.created_seq),
            rand::random::<u64>(),
        )
    })
}

// Alert handlers. Each runs under the entry lock and ends in sync() via
// the engine wrapper.

pub(crate) fn handle_alert(
    st: &mut EntryState,
    ctx: &Arc<EngineShared>,
    info_hash: InfoHash,
    alert: &Alert,
) {
    match alert {
        Alert::AddTorrent {
            handle,
            error,
            metadata,
            ..
        } => handle_add_torrent(st, ctx, *handle, error.clone(), metadata.clone()),
        Alert::TorrentRemoved { handle, .. } => handle_removed(st, *handle),
        Alert::MetadataReceived { handle } => handle_metadata_received(st, ctx, *handle),
        Alert::StateChanged { handle, prev, state } => {
            handle_state_changed(st, ctx, *handle, *prev, *state);
        }
        Alert::TorrentPaused { handle } => {
            if st.handle == Some(*handle) {
                st.pending.remove(&Action::Pause);
                st.flags |= torrent_flags::PAUSED;
            }
        }
        Alert::TorrentResumed { handle } => {
            if st.handle == Some(*handle) {
                st.flags &= !torrent_flags::PAUSED;
            }
        }
        Alert::TorrentError { handle, error } => {
            if st.handle == Some(*handle) {
                st.terminal_error = Some(error.clone());
                st.fail_requests(error);
            }
        }
        Alert::ReadPiece {
            handle,
            piece,
            data,
            error,
        } => handle_read_piece(st, ctx, *handle, *piece, data, error.clone()),
        Alert::PieceFinished { handle, piece } => {
            handle_piece_finished(st, ctx, info_hash, *handle, *piece);
        }
        Alert::HashFailed { handle, piece } => {
            if st.handle == Some(*handle) {
                st.have.set(*piece, false);
                st.fixup_changed_at = Instant::now();
            }
        }
        Alert::BlockWritten { handle, piece } => {
            if st.handle == Some(*handle)
                && ctx.fixup_enabled()
                && st.pieces_written.insert(*piece)
            {
                st.fixup_changed_at = Instant::now();
            }
        }
        _ => {}
    }
}

fn handle_add_torrent(
    st: &mut EntryState,
    ctx: &Arc<EngineShared>,
    handle: Option<TorrentHandle>,
    error: Option<Error>,
    metadata: Option<Arc<TorrentMetadata>>,
) {
    st.pending.remove(&Action::Add);
    st.atp = None;
    if let Some(error) = error {
        warn!(error = %error, "add failed");
        st.fail_requests(&error);
        return;
    }
    let Some(handle) = handle else {
        return;
    };
    if st.handle.is_some() && st.handle != Some(handle) {
        warn!("add acknowledged but a different handle is already live");
    }
    st.handle = Some(handle);
    st.piece_reading.clear();
    st.applied_reading.clear();
    st.applied_priorities.clear();
    st.applied_seq.clear();
    st.torrent_state = TorrentState::CheckingResumeData;

    if let Some(metadata) = metadata {
        st.set_metadata(metadata);
    } else if st.metadata.is_none()
        && let Ok(Some(metadata)) = ctx.backend().torrent_metadata(handle)
    {
        st.set_metadata(metadata);
    }
    refresh_have(st, ctx, handle);
    st.expects_data = false;
}

fn handle_removed(st: &mut EntryState, handle: TorrentHandle) {
    if st.pending.remove(&Action::Remove) {
        // Removal we asked for; a later request re-adds behind it.
        return;
    }
    if st.handle == Some(handle) {
        // Removed by someone else.
        st.handle = None;
        st.fail_requests(&Error::TorrentRemoved);
    }
}

fn handle_metadata_received(st: &mut EntryState, ctx: &Arc<EngineShared>, handle: TorrentHandle) {
    if st.handle != Some(handle) || st.metadata.is_some() {
        return;
    }
    match ctx.backend().torrent_metadata(handle) {
        Ok(Some(metadata)) => st.set_metadata(metadata),
        Ok(None) => warn!("metadata-received alert but the engine has no metadata"),
        Err(_) => {}
    }
}

fn handle_state_changed(
    st: &mut EntryState,
    ctx: &Arc<EngineShared>,
    handle: TorrentHandle,
    prev: TorrentState,
    state: TorrentState,
) {
    if st.handle != Some(handle) {
        return;
    }
    debug!(?prev, ?state, "state changed");
    st.torrent_state = state;
    st.fixup_changed_at = Instant::now();
    if prev.is_checking() && !state.is_checking() {
        // The check settled what data is actually on disk.
        refresh_have(st, ctx, handle);
        st.pieces_written.clear();
        st.expects_data = false;
    }
    // A torrent leaving downloading without finishing, while pieces sit
    // written-but-unhashed, has lost hash jobs; recover them.
    if ctx.fixup_enabled()
        && prev == TorrentState::Downloading
        && !matches!(state, TorrentState::Finished | TorrentState::Seeding)
        && !state.is_checking()
        && !st.pieces_written.is_empty()
    {
        warn!("pieces downloaded but never hashed; forcing recheck");
        engine_call(ctx.backend().force_recheck(handle), "force_recheck");
        st.pieces_written.clear();
    }
}

fn refresh_have(st: &mut EntryState, ctx: &Arc<EngineShared>, handle: TorrentHandle) {
    if let Ok(status) = ctx.backend().status(handle) {
        st.torrent_state = status.state;
        st.have = status.have;
        if let Some(meta) = &st.metadata
            && st.have.len() != meta.num_pieces
        {
            st.have = PieceBitmap::new(meta.num_pieces);
        }
    }
}

fn handle_read_piece(
    st: &mut EntryState,
    ctx: &Arc<EngineShared>,
    handle: TorrentHandle,
    piece: u32,
    data: &Arc<Vec<u8>>,
    error: Option<Error>,
) {
    if st.handle != Some(handle) {
        return;
    }
    st.piece_reading.remove(&piece);
    if let Some(error) = &error
        && error.is_cancellation()
    {
        // The engine fires a cancelled read whenever alert_when_available
        // is cleared; re-arm whatever the current schedule wants.
        update_priorities(st, ctx);
        return;
    }
    let Some(readers) = st.piece_to_readers.remove(&piece) else {
        return;
    };
    match error {
        Some(error) => {
            for reader in &readers {
                reader.set_error(error.clone());
            }
        }
        None => {
            let Some(meta) = &st.metadata else {
                return;
            };
            let offset = u64::from(piece) * meta.piece_length;
            for reader in &readers {
                reader.feed_chunk(offset, data);
            }
        }
    }
}

fn handle_piece_finished(
    st: &mut EntryState,
    ctx: &Arc<EngineShared>,
    info_hash: InfoHash,
    handle: TorrentHandle,
    piece: u32,
) {
    if st.handle != Some(handle) {
        return;
    }
    st.have.set(piece, true);
    st.applied_priorities.remove(&piece);
    st.applied_seq.remove(&piece);
    st.applied_reading.remove(&piece);
    st.pieces_written.remove(&piece);
    st.fixup_changed_at = Instant::now();

    let intersecting: Vec<Arc<RequestShared>> = st
        .requests
        .iter()
        .filter(|request| request.intersects(piece))
        .cloned()
        .collect();
    for request in &intersecting {
        request.mark_piece(piece);
    }

    if st.torrent_state.is_checking() {
        return;
    }
    let Some(meta) = &st.metadata else {
        return;
    };
    ctx.report_piece(info_hash, meta.piece_size(piece), pick_blame(&intersecting));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestParams;
    use peervod_core::TorrentSlice;

    fn request(mode: RequestMode, priority: u32, seq: u64, active: bool) -> Arc<RequestShared> {
        let shared = RequestShared::new(
            RequestParams::new(
                TorrentSlice::new(InfoHash::new([1; 20]), 0, 100),
                mode,
                "user",
                MetainfoSource::Magnet {
                    trackers: Vec::new(),
                },
            )
            .priority(priority),
            seq,
        );
        if !active {
            shared.deactivate();
        }
        shared
    }

    #[test]
    fn blame_prefers_active_read_requests() {
        let fill = request(RequestMode::Fill, 1_000, 1, true);
        let readahead = request(RequestMode::Readahead, 1_000, 2, true);
        let read = request(RequestMode::Read, 1_000, 3, true);
        let stale_read = request(RequestMode::Read, 1_000, 4, false);

        let all = vec![
            Arc::clone(&fill),
            Arc::clone(&stale_read),
            Arc::clone(&readahead),
            Arc::clone(&read),
        ];
        let blamed = pick_blame(&all).expect("blame");
        assert!(Arc::ptr_eq(blamed, &read));

        // Without the active read, the deactivated one still loses to
        // active requests of lesser modes.
        let rest = vec![Arc::clone(&stale_read), Arc::clone(&readahead)];
        assert!(Arc::ptr_eq(pick_blame(&rest).expect("blame"), &readahead));
    }

    #[test]
    fn blame_breaks_ties_by_priority_then_recency() {
        let low = request(RequestMode::Read, 10, 1, true);
        let high = request(RequestMode::Read, 20, 2, true);
        let all = vec![Arc::clone(&low), Arc::clone(&high)];
        assert!(Arc::ptr_eq(pick_blame(&all).expect("blame"), &high));

        let old = request(RequestMode::Read, 10, 1, true);
        let new = request(RequestMode::Read, 10, 9, true);
        let all = vec![Arc::clone(&old), Arc::clone(&new)];
        assert!(Arc::ptr_eq(pick_blame(&all).expect("blame"), &new));
    }

    #[test]
    fn keep_logic_matches_lifecycle() {
        let mut st = EntryState::new();
        assert!(!st.keep(), "empty entry is not kept");

        let req = request(RequestMode::Read, 1, 1, true);
        st.requests.push(req);
        assert!(st.keep(), "requests keep the entry");

        st.requests.clear();
        st.have = PieceBitmap::new(4);
        st.have.set(0, true);
        assert!(st.keep(), "data keeps the entry");

        st.removal_requested = true;
        assert!(!st.keep(), "explicit removal overrides data");

        st.removal_requested = false;
        st.have = PieceBitmap::new(4);
        st.expects_data = true;
        assert!(st.keep(), "restored descriptors keep the entry");
    }
}
