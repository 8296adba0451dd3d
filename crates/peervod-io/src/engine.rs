use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use peervod_acct::{AcctEvent, AcctSink, Blame};
use peervod_config::Config;
use peervod_core::{
    AddTorrentParams, Alert, AlertKind, AlertMask, Error, InfoHash, Result, SessionBackend,
    StorageMode, TorrentMetadata, TorrentSlice, TorrentState, category, torrent_flags,
};
use peervod_events::{AlertBus, AlertFilter, SubscriptionCloser};
use peervod_session::SessionService;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::entry::{self, Action, EntryState, TorrentEntry};
use crate::reader::TorrentReader;
use crate::request::{MetainfoFetcher, MetainfoSource, Request, RequestParams, RequestShared};

/// Engine versions before this one lose hash jobs under load; the
/// stuck-hash workaround is enabled only for them.
const FIXUP_FIXED_VERSION: (u32, u32, u32) = (2, 0, 7);
/// How long a downloading torrent may sit with written-but-unhashed pieces
/// before a recheck is forced.
const FIXUP_STUCK_AFTER: Duration = Duration::from_secs(3);
/// Cadence of presence snapshots posted to accounting.
const PRESENCE_INTERVAL: Duration = Duration::from_secs(1);

/// The alert mask the engine needs live.
const REQUIRED_MASK: AlertMask =
    AlertMask(category::STATUS | category::PIECE_PROGRESS | category::STORAGE);

/// Default save-path toggles staged from config.
struct AtpDefaults {
    save_path: PathBuf,
    apply_ip_filter: Option<bool>,
    storage_mode: StorageMode,
}

pub(crate) struct EngineShared {
    session: Arc<SessionService>,
    /// Runtime the service tasks run on; captured at start so requests
    /// submitted from plain reader threads can still spawn fetches.
    runtime: tokio::runtime::Handle,
    config_dir: PathBuf,
    torrents: Mutex<HashMap<InfoHash, Arc<TorrentEntry>>>,
    defaults: Mutex<AtpDefaults>,
    acct: Option<AcctSink>,
    fixup_enabled: bool,
    shutting_down: AtomicBool,
    created_seq: AtomicU64,
}

impl EngineShared {
    pub(crate) fn backend(&self) -> Arc<dyn SessionBackend> {
        self.session.backend()
    }

    pub(crate) fn fixup_enabled(&self) -> bool {
        self.fixup_enabled
    }

    /// Populate an add descriptor with the staged defaults.
    pub(crate) fn build_atp(
        &self,
        info_hash: InfoHash,
        metadata: Option<Arc<TorrentMetadata>>,
    ) -> AddTorrentParams {
        let defaults = lock(&self.defaults);
        let mut atp = AddTorrentParams::new(info_hash);
        atp.save_path.clone_from(&defaults.save_path);
        atp.storage_mode = defaults.storage_mode;
        match defaults.apply_ip_filter {
            Some(true) => atp.flags |= torrent_flags::APPLY_IP_FILTER,
            Some(false) => atp.flags &= !torrent_flags::APPLY_IP_FILTER,
            None => {}
        }
        atp.flags &= !(torrent_flags::PAUSED | torrent_flags::DUPLICATE_IS_ERROR);
        if let Some(metadata) = metadata {
            atp.piece_priorities = vec![0; metadata.num_pieces as usize];
            atp.metadata = Some(metadata);
        }
        atp
    }

    /// Resolve the metainfo fetch off the alert path, then hand the result
    /// back to the entry.
    pub(crate) fn spawn_fetch(self: &Arc<Self>, info_hash: InfoHash, fetcher: MetainfoFetcher) {
        let ctx = Arc::clone(self);
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let result = runtime
                .spawn_blocking(move || fetcher())
                .await
                .unwrap_or_else(|err| Err(Error::Fetch(err.to_string())));
            let mut result = Some(result);
            ctx.mutate_entry(info_hash, false, |st, ctx| {
                st.pending.remove(&Action::Fetch);
                match result.take().expect("fetch result consumed once") {
                    Err(err) => {
                        let err = match err {
                            fetch @ Error::Fetch(_) => fetch,
                            other => Error::Fetch(other.to_string()),
                        };
                        warn!(%info_hash, error = %err, "metainfo fetch failed");
                        st.fail_requests(&err);
                    }
                    Ok(bytes) => match TorrentMetadata::from_torrent_bytes(&bytes) {
                        Err(err) => {
                            st.fail_requests(&Error::Fetch(err.to_string()));
                        }
                        Ok(metadata) if metadata.info_hash != info_hash => {
                            st.fail_requests(&Error::Fetch(format!(
                                "fetched metainfo is for {}, wanted {info_hash}",
                                metadata.info_hash
                            )));
                        }
                        Ok(metadata) => {
                            debug!(%info_hash, "metainfo fetched");
                            let metadata = Arc::new(metadata);
                            st.set_metadata(Arc::clone(&metadata));
                            st.atp = Some(ctx.build_atp(info_hash, Some(metadata)));
                        }
                    },
                }
            });
        });
    }

    /// Post a piece-finished accounting event.
    pub(crate) fn report_piece(
        &self,
        info_hash: InfoHash,
        num_bytes: u64,
        blame: Option<&Arc<RequestShared>>,
    ) {
        let Some(acct) = &self.acct else {
            return;
        };
        let blame = blame.map(|request| Blame {
            user: request.params.user.clone(),
            tracker: request.params.tracker.clone(),
            requested_at: request.created_at,
        });
        let _ = acct.send(AcctEvent::Piece {
            info_hash,
            num_bytes,
            blame,
        });
    }

    fn presence_snapshot(&self) {
        let Some(acct) = &self.acct else {
            return;
        };
        let info_hashes: Vec<InfoHash> = lock(&self.torrents).keys().copied().collect();
        let _ = acct.send(AcctEvent::Presence { info_hashes });
    }

    /// Run `mutate` against the entry, then reconcile and garbage-collect.
    /// With `create`, a missing (or concurrently deleted) entry is
    /// recreated.
    pub(crate) fn mutate_entry<R>(
        self: &Arc<Self>,
        info_hash: InfoHash,
        create: bool,
        mut mutate: impl FnMut(&mut EntryState, &Arc<Self>) -> R,
    ) -> Option<R> {
        loop {
            let entry = {
                let mut torrents = lock(&self.torrents);
                match torrents.get(&info_hash) {
                    Some(entry) => Arc::clone(entry),
                    None if create => {
                        let entry = TorrentEntry::new(info_hash);
                        torrents.insert(info_hash, Arc::clone(&entry));
                        entry
                    }
                    None => return None,
                }
            };
            let (result, delete) = {
                let mut st = entry_lock(&entry);
                if st.dead {
                    // Lost a race with deletion; the map no longer holds
                    // this entry.
                    if create {
                        continue;
                    }
                    return None;
                }
                let result = mutate(&mut st, self);
                let delete = entry::sync(&mut st, self, info_hash);
                (result, delete)
            };
            if delete {
                self.delete_entry(info_hash, &entry);
            }
            return Some(result);
        }
    }

    fn delete_entry(&self, info_hash: InfoHash, entry: &Arc<TorrentEntry>) {
        let mut torrents = lock(&self.torrents);
        let Some(current) = torrents.get(&info_hash) else {
            return;
        };
        if !Arc::ptr_eq(current, entry) {
            return;
        }
        let mut st = entry_lock(entry);
        if !st.keep() && st.handle.is_none() && st.pending.is_empty() && st.requests.is_empty() {
            st.dead = true;
            drop(st);
            torrents.remove(&info_hash);
            debug!(%info_hash, "dropped idle torrent entry");
        }
    }

    /// Re-run reconciliation for one torrent.
    pub(crate) fn sync_entry(self: &Arc<Self>, info_hash: InfoHash) {
        self.mutate_entry(info_hash, false, |_, _| ());
    }

    pub(crate) fn add_request(self: &Arc<Self>, params: RequestParams) -> Request {
        let seq = self.created_seq.fetch_add(1, Ordering::SeqCst);
        let shared = RequestShared::new(params, seq);
        let request = Request {
            shared: Arc::clone(&shared),
            engine: Arc::downgrade(self),
        };
        if self.shutting_down.load(Ordering::SeqCst) {
            shared.set_error(Error::cancelled("request engine terminated"));
            return request;
        }
        self.mutate_entry(shared.info_hash(), true, |st, _| {
            st.attach_request(&shared);
        });
        request
    }

    fn handle_alert(self: &Arc<Self>, alert: &Alert) {
        let info_hash = alert.info_hash();
        self.mutate_entry(info_hash, false, |st, ctx| {
            entry::handle_alert(st, ctx, info_hash, alert);
        });
        if matches!(alert.kind(), AlertKind::AddTorrent | AlertKind::TorrentRemoved) {
            self.presence_snapshot();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn entry_lock(entry: &TorrentEntry) -> MutexGuard<'_, EntryState> {
    entry
        .state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn parse_defaults(config: &Config, config_dir: &Path) -> Result<AtpDefaults> {
    let save_path = config
        .get_str("torrent_default_save_path")?
        .map_or_else(|| config_dir.join("downloads"), PathBuf::from);
    std::fs::create_dir_all(&save_path).map_err(|err| {
        Error::InvalidConfig(format!(
            "creating save path {}: {err}",
            save_path.display()
        ))
    })?;
    // Resolve symlinks up front; a loop is a config error, not a runtime
    // surprise.
    let save_path = std::fs::canonicalize(&save_path).map_err(|err| {
        Error::InvalidConfig(format!(
            "resolving save path {}: {err}",
            save_path.display()
        ))
    })?;

    let apply_ip_filter = config.get_bool("torrent_default_flags_apply_ip_filter")?;

    let storage_mode = match config.get_str("torrent_default_storage_mode")? {
        None | Some("sparse") => StorageMode::Sparse,
        Some("allocate") => StorageMode::Allocate,
        Some(other) => {
            return Err(Error::InvalidConfig(format!(
                "invalid storage mode {other:?}"
            )));
        }
    };

    Ok(AtpDefaults {
        save_path,
        apply_ip_filter,
        storage_mode,
    })
}

/// The request engine: one entry per active infohash, reconciled against
/// the embedded engine by alert-driven `sync()` steps.
pub struct RequestEngine {
    shared: Arc<EngineShared>,
    closer: SubscriptionCloser,
    alert_task: Mutex<Option<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestEngine {
    /// Stage config defaults, subscribe to alerts, and start the service
    /// tasks. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for rejected defaults, or
    /// subscription errors.
    pub fn start(
        session: Arc<SessionService>,
        bus: &AlertBus,
        acct: Option<AcctSink>,
        config: &Config,
        config_dir: &Path,
    ) -> Result<Arc<Self>> {
        let defaults = parse_defaults(config, config_dir)?;
        let fixup_enabled = session.backend().version() < FIXUP_FIXED_VERSION;
        if fixup_enabled {
            warn!(
                version = ?session.backend().version(),
                "engine loses hash jobs; stuck-hash workaround enabled"
            );
        }
        session.inc_alert_mask(REQUIRED_MASK)?;

        let mut kinds = vec![
            AlertKind::AddTorrent,
            AlertKind::TorrentRemoved,
            AlertKind::MetadataReceived,
            AlertKind::StateChanged,
            AlertKind::TorrentPaused,
            AlertKind::TorrentResumed,
            AlertKind::TorrentError,
            AlertKind::ReadPiece,
            AlertKind::PieceFinished,
            AlertKind::HashFailed,
        ];
        if fixup_enabled {
            kinds.push(AlertKind::BlockWritten);
        }
        let mut sub = bus.subscribe(AlertFilter::all().kinds(&kinds), None)?;
        let closer = sub.closer();

        let shared = Arc::new(EngineShared {
            session,
            runtime: tokio::runtime::Handle::current(),
            config_dir: config_dir.to_path_buf(),
            torrents: Mutex::new(HashMap::new()),
            defaults: Mutex::new(defaults),
            acct,
            fixup_enabled,
            shutting_down: AtomicBool::new(false),
            created_seq: AtomicU64::new(1),
        });

        let alert_shared = Arc::clone(&shared);
        let alert_task = tokio::spawn(async move {
            loop {
                match sub.next().await {
                    Ok(Some(alert)) => alert_shared.handle_alert(&alert),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "request engine lost its alert stream");
                        break;
                    }
                }
            }
        });

        let mut background_tasks = Vec::new();
        let snapshot_shared = Arc::clone(&shared);
        background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRESENCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                snapshot_shared.presence_snapshot();
            }
        }));
        if fixup_enabled {
            let fixup_shared = Arc::clone(&shared);
            background_tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    fixup_tick(&fixup_shared);
                }
            }));
        }

        info!("request engine started");
        Ok(Arc::new(Self {
            shared,
            closer,
            alert_task: Mutex::new(Some(alert_task)),
            background_tasks: Mutex::new(background_tasks),
        }))
    }

    /// Re-stage the add-torrent defaults from a new config. Validation
    /// happens before anything is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on rejected values.
    pub fn set_config(&self, config: &Config) -> Result<()> {
        let defaults = parse_defaults(config, &self.shared.config_dir)?;
        *lock(&self.shared.defaults) = defaults;
        Ok(())
    }

    /// Create a request and start scheduling it.
    #[must_use]
    pub fn add_request(&self, params: RequestParams) -> Request {
        self.shared.add_request(params)
    }

    /// Track a torrent from a restored descriptor, without any request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the torrent is already tracked.
    pub fn add_torrent(&self, mut atp: AddTorrentParams) -> Result<()> {
        let info_hash = atp.info_hash;
        let entry = {
            let mut torrents = lock(&self.shared.torrents);
            if torrents.contains_key(&info_hash) {
                return Err(Error::Storage(format!(
                    "torrent {info_hash} already tracked"
                )));
            }
            let entry = TorrentEntry::new(info_hash);
            torrents.insert(info_hash, Arc::clone(&entry));
            entry
        };

        atp.flags &= !(torrent_flags::PAUSED | torrent_flags::DUPLICATE_IS_ERROR);
        if atp.save_path.as_os_str().is_empty() {
            atp.save_path
                .clone_from(&lock(&self.shared.defaults).save_path);
        }
        let expects_data = atp
            .resume
            .as_ref()
            .and_then(|blob| blob.as_dict())
            .and_then(|dict| dict.get(b"pieces".as_slice()))
            .and_then(peervod_core::bencode::Value::as_bytes)
            .is_some_and(|bytes| bytes.iter().any(|byte| *byte != 0));
        let metadata = atp.metadata.clone();
        if let Some(metadata) = &metadata {
            atp.piece_priorities = vec![0; metadata.num_pieces as usize];
        }

        let delete = {
            let mut st = entry_lock(&entry);
            if let Some(metadata) = metadata {
                st.set_metadata(metadata);
            }
            st.expects_data = expects_data;
            st.atp = Some(atp);
            entry::sync(&mut st, &self.shared, info_hash)
        };
        if delete {
            self.shared.delete_entry(info_hash, &entry);
        }
        Ok(())
    }

    /// Request removal of a torrent (and optionally its data), cancelling
    /// its requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the torrent is not tracked.
    pub fn remove_torrent(&self, info_hash: InfoHash, with_data: bool) -> Result<()> {
        self.shared
            .mutate_entry(info_hash, false, |st, _| st.request_removal(with_data))
            .ok_or(Error::InvalidHandle)
    }

    /// Open a buffered, seekable reader over a byte range.
    #[must_use]
    pub fn open(
        &self,
        slice: TorrentSlice,
        source: MetainfoSource,
        user: impl Into<String>,
        tracker: Option<String>,
    ) -> TorrentReader {
        TorrentReader::new(
            Arc::clone(&self.shared),
            slice,
            source,
            user.into(),
            tracker,
        )
    }

    /// Number of tracked torrents.
    #[must_use]
    pub fn torrent_count(&self) -> usize {
        lock(&self.shared.torrents).len()
    }

    /// Whether an infohash is currently tracked.
    #[must_use]
    pub fn has_torrent(&self, info_hash: InfoHash) -> bool {
        lock(&self.shared.torrents).contains_key(&info_hash)
    }

    /// Cancel every request and stop the service tasks. The session is left
    /// to the host to pause; resume flushing happens elsewhere.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<Arc<TorrentEntry>> =
            lock(&self.shared.torrents).values().cloned().collect();
        for entry in entries {
            let mut st = entry_lock(&entry);
            st.fail_requests(&Error::cancelled("request engine terminated"));
            for request in &st.requests {
                request.deactivate();
            }
            st.requests.clear();
            st.piece_to_readers.clear();
        }

        self.closer.close();
        if let Some(task) = lock(&self.alert_task).take() {
            let _ = task.await;
        }
        let tasks: Vec<_> = lock(&self.background_tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        if let Err(err) = self.shared.session.dec_alert_mask(REQUIRED_MASK) {
            warn!(error = %err, "failed to release request engine alert mask");
        }
        info!("request engine stopped");
    }
}

fn fixup_tick(shared: &Arc<EngineShared>) {
    let entries: Vec<Arc<TorrentEntry>> = lock(&shared.torrents).values().cloned().collect();
    for entry in entries {
        let mut st = entry_lock(&entry);
        let Some(handle) = st.handle else {
            continue;
        };
        if st.torrent_state != TorrentState::Downloading
            || st.pieces_written.is_empty()
            || st.fixup_changed_at.elapsed() < FIXUP_STUCK_AFTER
        {
            continue;
        }
        warn!(
            info_hash = %entry.info_hash,
            stuck = st.pieces_written.len(),
            "pieces written but never hashed; forcing recheck to recover hash jobs"
        );
        if shared.backend().force_recheck(handle).is_ok() {
            st.pieces_written.clear();
            st.fixup_changed_at = Instant::now();
        }
    }
}
