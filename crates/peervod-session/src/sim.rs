//! In-process reference implementation of [`SessionBackend`].
//!
//! The simulator keeps real payload files under each torrent's save path,
//! verifies pieces with SHA-1 against the metainfo, and models the
//! engine-side semantics the rest of the workspace depends on:
//!
//! - `set_piece_deadline(p, _, alert_when_available)` on a piece the engine
//!   has is equivalent to `read_piece(p)` and is not idempotent; on a
//!   missing piece it arms the flag idempotently.
//! - Clearing an armed flag (deadline without the flag, reset, or priority
//!   zero) fires a cancelled read alert.
//! - `save_resume_data` answers with exactly one success or failure alert;
//!   `only_if_modified` on an unmodified torrent answers with a failure.
//! - `find_torrent` is synchronized with the add/remove alert stream.
//!
//! Pieces "arrive from the network" when a seed is registered for the
//! torrent: each time the alert consumer would otherwise block, the
//! simulator completes the most urgent wanted piece (earliest deadline
//! first, then highest priority).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use peervod_core::bencode::Value;
use peervod_core::{
    AddTorrentParams, Alert, Error, FileEntry, InfoHash, PieceBitmap, Result, SessionBackend,
    SettingValue, TorrentHandle, TorrentMetadata, TorrentState, TorrentStatus, save_flags,
    torrent_flags,
};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::settings;

/// A registered "swarm": content the simulated network can serve.
struct Seed {
    metadata: Arc<TorrentMetadata>,
    content: Arc<Vec<u8>>,
}

struct Deadline {
    ms: u64,
    alert_when_available: bool,
}

struct SimTorrent {
    handle: TorrentHandle,
    metadata: Option<Arc<TorrentMetadata>>,
    save_path: PathBuf,
    flags: u64,
    state: TorrentState,
    have: PieceBitmap,
    downloaded: PieceBitmap,
    priorities: Vec<u8>,
    deadlines: HashMap<u32, Deadline>,
    resume_dirty: bool,
}

impl SimTorrent {
    fn total_done(&self) -> u64 {
        let Some(meta) = &self.metadata else {
            return 0;
        };
        (0..meta.num_pieces)
            .filter(|piece| self.have.get(*piece))
            .map(|piece| meta.piece_size(piece))
            .sum()
    }
}

struct SimState {
    torrents: HashMap<InfoHash, SimTorrent>,
    queue: VecDeque<Arc<Alert>>,
    seeds: HashMap<InfoHash, Seed>,
    applied_settings: BTreeMap<String, SettingValue>,
    settings_log: Vec<BTreeMap<String, SettingValue>>,
    next_handle_id: u64,
    auto_download: bool,
    session_paused: bool,
    hold_hashing: HashSet<InfoHash>,
    poisoned: HashSet<(InfoHash, u32)>,
    read_piece_calls: HashMap<(InfoHash, u32), usize>,
}

/// The simulated engine. Wrap in an [`Arc`] and share.
pub struct SimSession {
    state: Mutex<SimState>,
    cond: Condvar,
    version: (u32, u32, u32),
}

impl Default for SimSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSession {
    /// A simulator reporting a current engine version.
    #[must_use]
    pub fn new() -> Self {
        Self::with_version((2, 0, 10))
    }

    /// A simulator reporting the given engine version, for version-gated
    /// workaround tests.
    #[must_use]
    pub fn with_version(version: (u32, u32, u32)) -> Self {
        Self {
            state: Mutex::new(SimState {
                torrents: HashMap::new(),
                queue: VecDeque::new(),
                seeds: HashMap::new(),
                applied_settings: BTreeMap::new(),
                settings_log: Vec::new(),
                next_handle_id: 1,
                auto_download: true,
                session_paused: false,
                hold_hashing: HashSet::new(),
                poisoned: HashSet::new(),
                read_piece_calls: HashMap::new(),
            }),
            cond: Condvar::new(),
            version,
        }
    }

    /// Register content the simulated network can serve for a torrent.
    pub fn add_seed(&self, metadata: Arc<TorrentMetadata>, content: Vec<u8>) {
        assert_eq!(
            content.len() as u64,
            metadata.total_length,
            "seed content must match the metainfo length"
        );
        let mut state = self.lock();
        state.seeds.insert(
            metadata.info_hash,
            Seed {
                metadata,
                content: Arc::new(content),
            },
        );
    }

    /// Enable or disable simulated downloads.
    pub fn set_auto_download(&self, enabled: bool) {
        self.lock().auto_download = enabled;
        self.cond.notify_all();
    }

    /// Corrupt the next network write of one piece, so its hash check fails.
    pub fn poison_next_write(&self, info_hash: InfoHash, piece: u32) {
        self.lock().poisoned.insert((info_hash, piece));
    }

    /// While held, downloaded pieces are written to disk but never hashed,
    /// mimicking a lost hash job.
    pub fn hold_hashing(&self, info_hash: InfoHash, held: bool) {
        let mut state = self.lock();
        if held {
            state.hold_hashing.insert(info_hash);
        } else {
            state.hold_hashing.remove(&info_hash);
        }
        self.cond.notify_all();
    }

    /// Settings as currently applied.
    #[must_use]
    pub fn applied_settings(&self) -> BTreeMap<String, SettingValue> {
        self.lock().applied_settings.clone()
    }

    /// Every delta passed to [`SessionBackend::apply_settings`] since the
    /// last reset.
    #[must_use]
    pub fn settings_log(&self) -> Vec<BTreeMap<String, SettingValue>> {
        self.lock().settings_log.clone()
    }

    /// Clear the settings delta log.
    pub fn reset_settings_log(&self) {
        self.lock().settings_log.clear();
    }

    /// How many times [`SessionBackend::read_piece`] was called for a piece.
    #[must_use]
    pub fn read_piece_calls(&self, info_hash: InfoHash, piece: u32) -> usize {
        self.lock()
            .read_piece_calls
            .get(&(info_hash, piece))
            .copied()
            .unwrap_or(0)
    }

    /// Currently applied piece priorities for a torrent.
    #[must_use]
    pub fn piece_priorities(&self, info_hash: InfoHash) -> Option<Vec<u8>> {
        self.lock()
            .torrents
            .get(&info_hash)
            .map(|torrent| torrent.priorities.clone())
    }

    /// Currently armed piece deadlines for a torrent, as
    /// `piece -> (deadline_ms, alert_when_available)`.
    #[must_use]
    pub fn piece_deadlines(&self, info_hash: InfoHash) -> HashMap<u32, (u64, bool)> {
        self.lock()
            .torrents
            .get(&info_hash)
            .map(|torrent| {
                torrent
                    .deadlines
                    .iter()
                    .map(|(piece, deadline)| {
                        (*piece, (deadline.ms, deadline.alert_when_available))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Post a storage-category alert, standing in for an external rename.
    pub fn trigger_file_renamed(&self, handle: TorrentHandle) {
        self.post(Alert::FileRenamed { handle });
    }

    /// Post a storage-moved alert.
    pub fn trigger_storage_moved(&self, handle: TorrentHandle) {
        self.post(Alert::StorageMoved { handle });
    }

    /// Post a cache-flushed alert.
    pub fn trigger_cache_flushed(&self, handle: TorrentHandle) {
        self.post(Alert::CacheFlushed { handle });
    }

    fn post(&self, alert: Alert) {
        let mut state = self.lock();
        state.queue.push_back(Arc::new(alert));
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn torrent_mut(
        torrents: &mut HashMap<InfoHash, SimTorrent>,
        handle: TorrentHandle,
    ) -> Result<&mut SimTorrent> {
        match torrents.get_mut(&handle.info_hash) {
            Some(torrent) if torrent.handle == handle => Ok(torrent),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Download the most urgent wanted piece, if any. Returns whether any
    /// progress was made (and alerts queued).
    fn try_auto_download(&self, state: &mut SimState) -> bool {
        if !state.auto_download || state.session_paused {
            return false;
        }

        // Earliest deadline first; deadline pieces before priority-only
        // pieces; then highest priority, lowest index.
        let mut best: Option<(u64, u8, u32, InfoHash)> = None;
        for (info_hash, torrent) in &state.torrents {
            if torrent.flags & torrent_flags::PAUSED != 0
                || torrent.state.is_checking()
                || torrent.metadata.is_none()
                || !state.seeds.contains_key(info_hash)
            {
                continue;
            }
            for (piece, priority) in torrent.priorities.iter().enumerate() {
                let piece = piece as u32;
                if *priority == 0 || torrent.downloaded.get(piece) {
                    continue;
                }
                let deadline = torrent.deadlines.get(&piece).map_or(u64::MAX, |d| d.ms);
                let candidate = (deadline, 7_u8.saturating_sub(*priority), piece, *info_hash);
                if best.is_none_or(|current| candidate < current) {
                    best = Some(candidate);
                }
            }
        }
        let Some((_, _, piece, info_hash)) = best else {
            return false;
        };
        self.download_piece(state, info_hash, piece);
        true
    }

    fn download_piece(&self, state: &mut SimState, info_hash: InfoHash, piece: u32) {
        let poisoned = state.poisoned.remove(&(info_hash, piece));
        let held = state.hold_hashing.contains(&info_hash);
        let Some(torrent) = state.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(seed) = state.seeds.get(&info_hash) else {
            return;
        };
        let Some(meta) = torrent.metadata.clone() else {
            return;
        };

        let start = u64::from(piece) * meta.piece_length;
        let size = meta.piece_size(piece) as usize;
        let mut bytes = seed.content[start as usize..start as usize + size].to_vec();
        if poisoned && !bytes.is_empty() {
            bytes[0] ^= 0xff;
        }

        if let Err(err) = write_linear(&torrent.save_path, &meta, start, &bytes) {
            warn!(%info_hash, piece, error = %err, "simulated disk write failed");
            state
                .queue
                .push_back(Arc::new(Alert::TorrentError {
                    handle: torrent.handle,
                    error: Error::Storage(err.to_string()),
                }));
            self.cond.notify_all();
            return;
        }
        torrent.downloaded.set(piece, true);
        torrent.resume_dirty = true;
        state.queue.push_back(Arc::new(Alert::BlockWritten {
            handle: torrent.handle,
            piece,
        }));

        if held {
            // Hash job lost; recovery only through force_recheck.
            self.cond.notify_all();
            return;
        }

        let digest = Sha1::digest(&bytes);
        if digest.as_slice() == meta.piece_hashes[piece as usize] {
            Self::complete_piece(&mut state.queue, torrent, &meta, piece, Arc::new(bytes));
        } else {
            torrent.downloaded.set(piece, false);
            state.queue.push_back(Arc::new(Alert::HashFailed {
                handle: torrent.handle,
                piece,
            }));
        }
        self.cond.notify_all();
    }

    fn complete_piece(
        queue: &mut VecDeque<Arc<Alert>>,
        torrent: &mut SimTorrent,
        meta: &TorrentMetadata,
        piece: u32,
        bytes: Arc<Vec<u8>>,
    ) {
        torrent.have.set(piece, true);
        let alert_when = torrent
            .deadlines
            .remove(&piece)
            .is_some_and(|deadline| deadline.alert_when_available);
        queue.push_back(Arc::new(Alert::PieceFinished {
            handle: torrent.handle,
            piece,
        }));
        if alert_when {
            queue.push_back(Arc::new(Alert::ReadPiece {
                handle: torrent.handle,
                piece,
                data: bytes,
                error: None,
            }));
        }
        if torrent.have.all_set() && meta.num_pieces > 0 {
            let prev = torrent.state;
            torrent.state = TorrentState::Finished;
            queue.push_back(Arc::new(Alert::StateChanged {
                handle: torrent.handle,
                prev,
                state: TorrentState::Finished,
            }));
            queue.push_back(Arc::new(Alert::TorrentFinished {
                handle: torrent.handle,
            }));
        }
    }

    fn read_piece_bytes(torrent: &SimTorrent, piece: u32) -> Result<Vec<u8>> {
        let meta = torrent
            .metadata
            .as_ref()
            .ok_or_else(|| Error::Storage("no metadata".into()))?;
        let start = u64::from(piece) * meta.piece_length;
        read_linear(&torrent.save_path, meta, start, meta.piece_size(piece) as usize)
            .map_err(|err| Error::Storage(err.to_string()))
    }

    /// Re-verify every piece from disk. Returns the finishing state change.
    fn recheck_torrent(queue: &mut VecDeque<Arc<Alert>>, torrent: &mut SimTorrent) {
        let Some(meta) = torrent.metadata.clone() else {
            return;
        };
        let prev = torrent.state;
        torrent.state = TorrentState::CheckingFiles;
        queue.push_back(Arc::new(Alert::StateChanged {
            handle: torrent.handle,
            prev,
            state: TorrentState::CheckingFiles,
        }));

        torrent.have = PieceBitmap::new(meta.num_pieces);
        torrent.downloaded = PieceBitmap::new(meta.num_pieces);
        for piece in 0..meta.num_pieces {
            if Self::verify_piece(torrent, &meta, piece) {
                torrent.have.set(piece, true);
                torrent.downloaded.set(piece, true);
            }
        }
        torrent.resume_dirty = true;

        let state = if meta.num_pieces > 0 && torrent.have.all_set() {
            TorrentState::Finished
        } else {
            TorrentState::Downloading
        };
        torrent.state = state;
        queue.push_back(Arc::new(Alert::StateChanged {
            handle: torrent.handle,
            prev: TorrentState::CheckingFiles,
            state,
        }));
    }

    fn verify_piece(torrent: &SimTorrent, meta: &TorrentMetadata, piece: u32) -> bool {
        let start = u64::from(piece) * meta.piece_length;
        match read_linear(&torrent.save_path, meta, start, meta.piece_size(piece) as usize) {
            Ok(bytes) => Sha1::digest(&bytes).as_slice() == meta.piece_hashes[piece as usize],
            Err(_) => false,
        }
    }

    fn build_resume_blob(torrent: &SimTorrent) -> Value {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"file-format".to_vec(),
            Value::bytes("libtorrent resume file"),
        );
        dict.insert(
            b"info-hash".to_vec(),
            Value::bytes(torrent.handle.info_hash.as_bytes().to_vec()),
        );
        dict.insert(
            b"save_path".to_vec(),
            Value::bytes(torrent.save_path.to_string_lossy().into_owned()),
        );
        dict.insert(b"pieces".to_vec(), Value::bytes(torrent.have.as_bytes().to_vec()));
        dict.insert(
            b"paused".to_vec(),
            Value::Int(i64::from(torrent.flags & torrent_flags::PAUSED != 0)),
        );
        if let Some(meta) = &torrent.metadata {
            dict.insert(b"info".to_vec(), Value::Bytes(meta.info_bytes.clone()));
        }
        Value::Dict(dict)
    }
}

impl SessionBackend for SimSession {
    fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    fn apply_settings(&self, delta: &BTreeMap<String, SettingValue>) -> Result<()> {
        for name in delta.keys() {
            if settings::kind(name).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "unknown session setting \"{name}\""
                )));
            }
        }
        let mut state = self.lock();
        for (name, value) in delta {
            state.applied_settings.insert(name.clone(), value.clone());
        }
        state.settings_log.push(delta.clone());
        Ok(())
    }

    fn async_add_torrent(&self, params: AddTorrentParams) -> Result<()> {
        let mut state = self.lock();
        let info_hash = params.info_hash;

        if let Some(existing) = state.torrents.get(&info_hash) {
            let alert = if params.flags & torrent_flags::DUPLICATE_IS_ERROR != 0 {
                Alert::AddTorrent {
                    info_hash,
                    handle: None,
                    error: Some(Error::Storage("torrent already in session".into())),
                    metadata: params.metadata,
                }
            } else {
                Alert::AddTorrent {
                    info_hash,
                    handle: Some(existing.handle),
                    error: None,
                    metadata: params.metadata,
                }
            };
            state.queue.push_back(Arc::new(alert));
            self.cond.notify_all();
            return Ok(());
        }

        let handle = TorrentHandle {
            info_hash,
            id: state.next_handle_id,
        };
        state.next_handle_id += 1;

        // Magnet-style adds resolve against a known seed.
        let metadata = params
            .metadata
            .clone()
            .or_else(|| state.seeds.get(&info_hash).map(|seed| Arc::clone(&seed.metadata)));
        let fetched = params.metadata.is_none() && metadata.is_some();

        let num_pieces = metadata.as_ref().map_or(0, |meta| meta.num_pieces);
        let priorities = if params.piece_priorities.is_empty() {
            vec![4_u8; num_pieces as usize]
        } else {
            let mut priorities = params.piece_priorities.clone();
            priorities.resize(num_pieces as usize, 0);
            priorities
        };

        let mut torrent = SimTorrent {
            handle,
            metadata: metadata.clone(),
            save_path: params.save_path.clone(),
            flags: params.flags,
            state: if metadata.is_some() {
                TorrentState::CheckingResumeData
            } else {
                TorrentState::DownloadingMetadata
            },
            have: PieceBitmap::new(num_pieces),
            downloaded: PieceBitmap::new(num_pieces),
            priorities,
            deadlines: HashMap::new(),
            resume_dirty: params.resume.is_none(),
        };

        state.queue.push_back(Arc::new(Alert::AddTorrent {
            info_hash,
            handle: Some(handle),
            error: None,
            metadata: params.metadata.clone(),
        }));
        if fetched {
            state
                .queue
                .push_back(Arc::new(Alert::MetadataReceived { handle }));
            torrent.resume_dirty = true;
        }
        if torrent.metadata.is_none() {
            state.queue.push_back(Arc::new(Alert::StateChanged {
                handle,
                prev: TorrentState::CheckingResumeData,
                state: TorrentState::DownloadingMetadata,
            }));
            torrent.state = TorrentState::DownloadingMetadata;
        }

        if let Some(meta) = metadata {
            // Resume restore: verify claimed pieces against the disk.
            let claimed = params
                .resume
                .as_ref()
                .and_then(|blob| blob.as_dict())
                .and_then(|dict| dict.get(b"pieces".as_slice()))
                .and_then(Value::as_bytes)
                .map(|bytes| PieceBitmap::from_bytes(bytes.to_vec(), meta.num_pieces));
            if let Some(claimed) = claimed {
                for piece in 0..meta.num_pieces {
                    if claimed.get(piece) && Self::verify_piece(&torrent, &meta, piece) {
                        torrent.have.set(piece, true);
                        torrent.downloaded.set(piece, true);
                    }
                }
                if torrent.have != claimed {
                    torrent.resume_dirty = true;
                }
            }
            let settled = if meta.num_pieces > 0 && torrent.have.all_set() {
                TorrentState::Finished
            } else {
                TorrentState::Downloading
            };
            torrent.state = settled;
            state.queue.push_back(Arc::new(Alert::StateChanged {
                handle,
                prev: TorrentState::CheckingResumeData,
                state: settled,
            }));
        }

        debug!(%info_hash, handle = %handle, "torrent added to simulator");
        state.torrents.insert(info_hash, torrent);
        self.cond.notify_all();
        Ok(())
    }

    fn remove_torrent(&self, handle: TorrentHandle, with_data: bool) -> Result<()> {
        let mut state = self.lock();
        Self::torrent_mut(&mut state.torrents, handle)?;
        let torrent = state
            .torrents
            .remove(&handle.info_hash)
            .ok_or(Error::InvalidHandle)?;
        state.queue.push_back(Arc::new(Alert::TorrentRemoved {
            info_hash: handle.info_hash,
            handle,
        }));
        if with_data
            && let Some(meta) = &torrent.metadata
        {
            for entry in &meta.files {
                if entry.is_symlink {
                    continue;
                }
                let _ = fs::remove_file(file_path(&torrent.save_path, entry));
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle> {
        self.lock()
            .torrents
            .get(&info_hash)
            .map(|torrent| torrent.handle)
    }

    fn torrent_handles(&self) -> Vec<TorrentHandle> {
        self.lock()
            .torrents
            .values()
            .map(|torrent| torrent.handle)
            .collect()
    }

    fn pause_session(&self) {
        self.lock().session_paused = true;
        self.cond.notify_all();
    }

    fn status(&self, handle: TorrentHandle) -> Result<TorrentStatus> {
        let mut state = self.lock();
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        Ok(TorrentStatus {
            state: torrent.state,
            flags: torrent.flags,
            have: torrent.have.clone(),
            total_done: torrent.total_done(),
            pieces_downloaded: torrent.downloaded.count_set(),
        })
    }

    fn torrent_metadata(&self, handle: TorrentHandle) -> Result<Option<Arc<TorrentMetadata>>> {
        let mut state = self.lock();
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        Ok(torrent.metadata.clone())
    }

    fn prioritize_pieces(&self, handle: TorrentHandle, priorities: &[(u32, u8)]) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        let mut cancelled = Vec::new();
        for (piece, priority) in priorities {
            let index = *piece as usize;
            if index >= torrent.priorities.len() {
                continue;
            }
            torrent.priorities[index] = *priority;
            if *priority == 0
                && !torrent.have.get(*piece)
                && torrent
                    .deadlines
                    .remove(piece)
                    .is_some_and(|deadline| deadline.alert_when_available)
            {
                cancelled.push(*piece);
            }
        }
        let torrent_handle = torrent.handle;
        for piece in cancelled {
            state.queue.push_back(Arc::new(Alert::ReadPiece {
                handle: torrent_handle,
                piece,
                data: Arc::new(Vec::new()),
                error: Some(Error::cancelled("piece deadline removed")),
            }));
        }
        self.cond.notify_all();
        Ok(())
    }

    fn set_piece_deadline(
        &self,
        handle: TorrentHandle,
        piece: u32,
        deadline_ms: u64,
        alert_when_available: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        if torrent.have.get(piece) {
            if alert_when_available {
                let result = Self::read_piece_bytes(torrent, piece);
                let alert = match result {
                    Ok(bytes) => Alert::ReadPiece {
                        handle,
                        piece,
                        data: Arc::new(bytes),
                        error: None,
                    },
                    Err(err) => Alert::ReadPiece {
                        handle,
                        piece,
                        data: Arc::new(Vec::new()),
                        error: Some(err),
                    },
                };
                state.queue.push_back(Arc::new(alert));
                self.cond.notify_all();
            }
            return Ok(());
        }
        if piece as usize >= torrent.priorities.len() {
            return Ok(());
        }
        let previous = torrent.deadlines.insert(
            piece,
            Deadline {
                ms: deadline_ms,
                alert_when_available,
            },
        );
        torrent.priorities[piece as usize] = 7;
        if previous.is_some_and(|deadline| deadline.alert_when_available) && !alert_when_available {
            state.queue.push_back(Arc::new(Alert::ReadPiece {
                handle,
                piece,
                data: Arc::new(Vec::new()),
                error: Some(Error::cancelled("alert_when_available cleared")),
            }));
        }
        self.cond.notify_all();
        Ok(())
    }

    fn reset_piece_deadline(&self, handle: TorrentHandle, piece: u32) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        if (piece as usize) < torrent.priorities.len() {
            torrent.priorities[piece as usize] = 1;
        }
        if !torrent.have.get(piece)
            && torrent
                .deadlines
                .remove(&piece)
                .is_some_and(|deadline| deadline.alert_when_available)
        {
            state.queue.push_back(Arc::new(Alert::ReadPiece {
                handle,
                piece,
                data: Arc::new(Vec::new()),
                error: Some(Error::cancelled("piece deadline removed")),
            }));
            self.cond.notify_all();
        }
        Ok(())
    }

    fn read_piece(&self, handle: TorrentHandle, piece: u32) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        *state
            .read_piece_calls
            .entry((handle.info_hash, piece))
            .or_insert(0) += 1;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        let alert = if torrent.have.get(piece) {
            match Self::read_piece_bytes(torrent, piece) {
                Ok(bytes) => Alert::ReadPiece {
                    handle,
                    piece,
                    data: Arc::new(bytes),
                    error: None,
                },
                Err(err) => Alert::ReadPiece {
                    handle,
                    piece,
                    data: Arc::new(Vec::new()),
                    error: Some(err),
                },
            }
        } else {
            Alert::ReadPiece {
                handle,
                piece,
                data: Arc::new(Vec::new()),
                error: Some(Error::Storage("piece not downloaded".into())),
            }
        };
        state.queue.push_back(Arc::new(alert));
        self.cond.notify_all();
        Ok(())
    }

    fn set_flags(&self, handle: TorrentHandle, flags: u64, mask: u64) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        let was_paused = torrent.flags & torrent_flags::PAUSED != 0;
        torrent.flags = (torrent.flags & !mask) | (flags & mask);
        // Auto-managed torrents are resumed by the engine's queue manager.
        if torrent.flags & torrent_flags::AUTO_MANAGED != 0 {
            torrent.flags &= !torrent_flags::PAUSED;
        }
        let now_paused = torrent.flags & torrent_flags::PAUSED != 0;
        if was_paused != now_paused {
            torrent.resume_dirty = true;
            let alert = if now_paused {
                Alert::TorrentPaused { handle }
            } else {
                Alert::TorrentResumed { handle }
            };
            state.queue.push_back(Arc::new(alert));
        }
        self.cond.notify_all();
        Ok(())
    }

    fn clear_error(&self, handle: TorrentHandle) -> Result<()> {
        let mut state = self.lock();
        Self::torrent_mut(&mut state.torrents, handle)?;
        Ok(())
    }

    fn force_recheck(&self, handle: TorrentHandle) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        Self::recheck_torrent(&mut state.queue, torrent);
        self.cond.notify_all();
        Ok(())
    }

    fn save_resume_data(&self, handle: TorrentHandle, flags: u8) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let torrent = Self::torrent_mut(&mut state.torrents, handle)?;
        if flags & save_flags::ONLY_IF_MODIFIED != 0 && !torrent.resume_dirty {
            let info_hash = handle.info_hash;
            state
                .queue
                .push_back(Arc::new(Alert::SaveResumeDataFailed {
                    handle,
                    info_hash,
                    error: Error::Storage("resume data not modified".into()),
                }));
            self.cond.notify_all();
            return Ok(());
        }
        torrent.resume_dirty = false;
        let resume = Self::build_resume_blob(torrent);
        let metadata = torrent.metadata.clone();
        let info_hash = handle.info_hash;
        state.queue.push_back(Arc::new(Alert::SaveResumeData {
            handle,
            info_hash,
            resume,
            metadata,
        }));
        self.cond.notify_all();
        Ok(())
    }

    fn wait_for_alerts(&self, timeout: Duration) -> Vec<Arc<Alert>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.queue.is_empty() {
                return state.queue.drain(..).collect();
            }
            if self.try_auto_download(&mut state) {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
        }
    }
}

fn file_path(save_path: &Path, entry: &FileEntry) -> PathBuf {
    let mut path = save_path.to_path_buf();
    for component in &entry.path {
        path.push(component);
    }
    path
}

fn write_linear(
    save_path: &Path,
    meta: &TorrentMetadata,
    start: u64,
    data: &[u8],
) -> std::io::Result<()> {
    let stop = start + data.len() as u64;
    for entry in &meta.files {
        if entry.is_symlink || entry.is_empty() {
            continue;
        }
        let overlap_start = entry.start.max(start);
        let overlap_stop = entry.stop.min(stop);
        if overlap_start >= overlap_stop {
            continue;
        }
        let path = file_path(save_path, entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(overlap_start - entry.start))?;
        let slice = &data[(overlap_start - start) as usize..(overlap_stop - start) as usize];
        file.write_all(slice)?;
    }
    Ok(())
}

fn read_linear(
    save_path: &Path,
    meta: &TorrentMetadata,
    start: u64,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    let stop = start + len as u64;
    let mut out = vec![0_u8; len];
    for entry in &meta.files {
        if entry.is_symlink || entry.is_empty() {
            continue;
        }
        let overlap_start = entry.start.max(start);
        let overlap_stop = entry.stop.min(stop);
        if overlap_start >= overlap_stop {
            continue;
        }
        let path = file_path(save_path, entry);
        let mut file = fs::File::open(&path)?;
        file.seek(SeekFrom::Start(overlap_start - entry.start))?;
        let slice =
            &mut out[(overlap_start - start) as usize..(overlap_stop - start) as usize];
        file.read_exact(slice)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_test_support::SyntheticTorrent;

    fn drain(session: &SimSession) -> Vec<Arc<Alert>> {
        session.wait_for_alerts(Duration::from_millis(50))
    }

    fn add_with_seed(session: &SimSession, dir: &Path) -> (Arc<TorrentMetadata>, TorrentHandle) {
        let torrent = SyntheticTorrent::single_file(4_096, 1_024);
        let meta = Arc::new(torrent.metadata.clone());
        session.add_seed(Arc::clone(&meta), torrent.content.clone());
        let mut params = AddTorrentParams::new(meta.info_hash);
        params.metadata = Some(Arc::clone(&meta));
        params.save_path = dir.to_path_buf();
        params.piece_priorities = vec![0; meta.num_pieces as usize];
        session.async_add_torrent(params).unwrap();
        let handle = session.find_torrent(meta.info_hash).expect("handle");
        (meta, handle)
    }

    #[test]
    fn add_produces_handle_and_state_alerts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (meta, handle) = add_with_seed(&session, dir.path());

        let alerts = drain(&session);
        assert!(matches!(
            alerts[0].as_ref(),
            Alert::AddTorrent { handle: Some(_), error: None, .. }
        ));
        assert!(alerts.iter().any(|alert| matches!(
            alert.as_ref(),
            Alert::StateChanged { state: TorrentState::Downloading, .. }
        )));
        assert_eq!(session.find_torrent(meta.info_hash), Some(handle));
        Ok(())
    }

    #[test]
    fn deadline_pieces_download_in_deadline_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (_meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);

        session.set_piece_deadline(handle, 3, 20_000, false)?;
        session.set_piece_deadline(handle, 1, 10_000, false)?;

        let mut finished = Vec::new();
        while finished.len() < 2 {
            for alert in drain(&session) {
                if let Alert::PieceFinished { piece, .. } = alert.as_ref() {
                    finished.push(*piece);
                }
            }
        }
        assert_eq!(finished, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn alert_when_available_on_have_piece_reads_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);

        session.set_piece_deadline(handle, 0, 0, true)?;
        // Wait for completion plus the read-back.
        let mut data = None;
        for _ in 0..10 {
            for alert in drain(&session) {
                if let Alert::ReadPiece {
                    piece: 0,
                    data: bytes,
                    error: None,
                    ..
                } = alert.as_ref()
                {
                    data = Some(bytes.as_ref().clone());
                }
            }
            if data.is_some() {
                break;
            }
        }
        let data = data.expect("read piece data");
        assert_eq!(data.len() as u64, meta.piece_size(0));
        Ok(())
    }

    #[test]
    fn clearing_armed_flag_fires_cancelled_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        session.set_auto_download(false);
        let (_meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);

        session.set_piece_deadline(handle, 2, 0, true)?;
        session.reset_piece_deadline(handle, 2)?;
        let alerts = drain(&session);
        assert!(alerts.iter().any(|alert| matches!(
            alert.as_ref(),
            Alert::ReadPiece { piece: 2, error: Some(err), .. } if err.is_cancellation()
        )));
        Ok(())
    }

    #[test]
    fn poisoned_piece_fails_hash_then_recovers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);
        session.poison_next_write(meta.info_hash, 0);
        session.set_piece_deadline(handle, 0, 0, false)?;

        let mut saw_hash_failure = false;
        let mut finished = false;
        for _ in 0..20 {
            for alert in drain(&session) {
                match alert.as_ref() {
                    Alert::HashFailed { piece: 0, .. } => saw_hash_failure = true,
                    Alert::PieceFinished { piece: 0, .. } => finished = true,
                    _ => {}
                }
            }
            if finished {
                break;
            }
        }
        assert!(saw_hash_failure, "poisoned write must fail its hash check");
        assert!(finished, "piece must be re-downloaded after the failure");
        Ok(())
    }

    #[test]
    fn save_resume_honors_only_if_modified() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (_meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);

        session.save_resume_data(handle, 0)?;
        let alerts = drain(&session);
        assert!(alerts.iter().any(|alert| matches!(
            alert.as_ref(),
            Alert::SaveResumeData { resume: Value::Dict(_), .. }
        )));

        session.save_resume_data(handle, save_flags::ONLY_IF_MODIFIED)?;
        let alerts = drain(&session);
        assert!(alerts.iter().any(|alert| matches!(
            alert.as_ref(),
            Alert::SaveResumeDataFailed { .. }
        )));
        Ok(())
    }

    #[test]
    fn remove_invalidates_handle_and_find() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);

        session.remove_torrent(handle, false)?;
        assert_eq!(session.find_torrent(meta.info_hash), None);
        assert!(matches!(
            session.status(handle),
            Err(Error::InvalidHandle)
        ));
        let alerts = drain(&session);
        assert!(alerts.iter().any(|alert| matches!(
            alert.as_ref(),
            Alert::TorrentRemoved { .. }
        )));
        Ok(())
    }

    #[test]
    fn resume_restore_verifies_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let session = SimSession::new();
        let (meta, handle) = add_with_seed(&session, dir.path());
        drain(&session);
        // Download everything.
        for piece in 0..meta.num_pieces {
            session.set_piece_deadline(handle, piece, 0, false)?;
        }
        loop {
            let status = session.status(handle)?;
            if status.have.all_set() {
                break;
            }
            drain(&session);
        }
        session.save_resume_data(handle, 0)?;
        let resume = drain(&session)
            .into_iter()
            .find_map(|alert| match alert.as_ref() {
                Alert::SaveResumeData { resume, .. } => Some(resume.clone()),
                _ => None,
            })
            .expect("resume blob");

        // Fresh engine instance restoring from the blob sees the data.
        let restored = SimSession::new();
        let mut params = AddTorrentParams::new(meta.info_hash);
        params.metadata = Some(Arc::clone(&meta));
        params.save_path = dir.path().to_path_buf();
        params.resume = Some(resume);
        params.piece_priorities = vec![0; meta.num_pieces as usize];
        restored.async_add_torrent(params)?;
        let handle = restored.find_torrent(meta.info_hash).expect("handle");
        let status = restored.status(handle)?;
        assert!(status.have.all_set(), "verified pieces must be restored");
        Ok(())
    }
}
