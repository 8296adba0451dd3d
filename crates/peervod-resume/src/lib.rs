#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Resume persistence: re-hydrates torrents at startup and keeps
//! `resume/<hex>.resume` + `resume/<hex>.torrent` current while the session
//! runs.
//!
//! Layout under the config directory:
//!
//! ```text
//! resume/<40-hex>.resume    -- engine resume blob, `info` dict stripped
//! resume/<40-hex>.torrent   -- bencoded { "info": <dict> }
//! ```
//!
//! All file writes funnel through one writer thread, so writes for the same
//! infohash are strictly serialized, and each write is atomic
//! (`<file>.tmp` + rename).

mod store;
mod writer;

pub use store::{ResumeDataIter, iter_resume_data, resume_data_path, torrent_path};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use peervod_core::bencode;
use peervod_core::{
    Alert, AlertKind, AlertMask, Error, Result, TorrentHandle, category, save_flags,
};
use peervod_events::{AlertBus, AlertFilter, Subscription, SubscriptionCloser};
use peervod_session::SessionService;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use writer::{WriteJob, Writer};

/// Directory under the config dir holding resume artifacts.
pub const RESUME_DIR_NAME: &str = "resume";

/// Interval of the periodic save-all sweep.
const SAVE_ALL_INTERVAL: Duration = Duration::from_secs(196);
/// How long shutdown waits for outstanding resume blobs.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Counts `save_resume_data` calls that have not yet been answered by a
/// success or failure alert.
struct PendingCounter {
    value: Mutex<i64>,
    zero: Condvar,
}

impl PendingCounter {
    fn new() -> Self {
        Self {
            value: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    fn inc(&self) {
        let mut value = self.lock();
        *value += 1;
    }

    fn dec(&self) {
        let mut value = self.lock();
        *value -= 1;
        if *value < 0 {
            warn!(
                "more save_resume_data answers than calls; someone else is \
                 calling save_resume_data, or this is a bug"
            );
            *value = 0;
        }
        if *value == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_zero(&self, timeout: Duration) -> bool {
        let value = self.lock();
        let (value, result) = self
            .zero
            .wait_timeout_while(value, timeout, |value| *value != 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(value);
        !result.timed_out()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, i64> {
        self.value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Owns resume-data management for the whole session.
pub struct ResumeService {
    session: Arc<SessionService>,
    data_dir: PathBuf,
    counter: Arc<PendingCounter>,
    writer: Writer,
    receiver_task: JoinHandle<()>,
    trigger_task: JoinHandle<()>,
    periodic_task: JoinHandle<()>,
    receiver_closer: SubscriptionCloser,
    trigger_closer: SubscriptionCloser,
}

/// The alert mask this service needs live.
const REQUIRED_MASK: AlertMask = AlertMask(category::STATUS | category::STORAGE);

impl ResumeService {
    /// Subscribe to the bus and start the receiver, trigger, periodic, and
    /// writer workers. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if subscriptions or the alert mask cannot be set
    /// up.
    pub fn start(
        config_dir: &Path,
        session: Arc<SessionService>,
        bus: &AlertBus,
    ) -> Result<Self> {
        let data_dir = config_dir.join(RESUME_DIR_NAME);
        session.inc_alert_mask(REQUIRED_MASK)?;

        let counter = Arc::new(PendingCounter::new());
        let writer = Writer::spawn();

        // The receiver also handles metadata-received, so a just-fetched
        // .torrent is persisted even during shutdown.
        let receiver_sub = bus.subscribe(
            AlertFilter::all().kinds(&[
                AlertKind::SaveResumeData,
                AlertKind::SaveResumeDataFailed,
                AlertKind::TorrentRemoved,
                AlertKind::AddTorrent,
                AlertKind::MetadataReceived,
            ]),
            None,
        )?;
        let receiver_closer = receiver_sub.closer();
        let receiver_task = tokio::spawn(receiver_loop(
            receiver_sub,
            Arc::clone(&session),
            data_dir.clone(),
            Arc::clone(&counter),
            writer.sender(),
        ));

        let trigger_sub = bus.subscribe(
            AlertFilter::all().kinds(&[
                AlertKind::FileRenamed,
                AlertKind::TorrentPaused,
                AlertKind::TorrentFinished,
                AlertKind::StorageMoved,
                AlertKind::CacheFlushed,
            ]),
            None,
        )?;
        let trigger_closer = trigger_sub.closer();
        let trigger_task = tokio::spawn(trigger_loop(
            trigger_sub,
            Arc::clone(&session),
            Arc::clone(&counter),
        ));

        let periodic_task = tokio::spawn(periodic_loop(
            Arc::clone(&session),
            Arc::clone(&counter),
        ));

        Ok(Self {
            session,
            data_dir,
            counter,
            writer,
            receiver_task,
            trigger_task,
            periodic_task,
            receiver_closer,
            trigger_closer,
        })
    }

    /// The resume-data directory this service writes to.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Ask the engine to save resume data for one torrent.
    pub fn save(&self, handle: TorrentHandle, flags: u8) {
        save(&self.session, &self.counter, handle, flags);
    }

    /// Ask the engine to save resume data for every torrent.
    pub fn save_all(&self, flags: u8) {
        save_all(&self.session, &self.counter, flags);
    }

    /// Final flush: issue one last save-all, wait for outstanding blobs,
    /// and stop all workers.
    ///
    /// Call after request serving has stopped and the session is paused. If
    /// the drain times out an error is logged and shutdown continues.
    pub async fn shutdown(self) {
        // Trigger and periodic may not have seen their last alerts, but the
        // final save_all covers everything they would have done.
        self.trigger_closer.close();
        self.periodic_task.abort();
        let _ = self.trigger_task.await;
        let _ = self.periodic_task.await;

        save_all(
            &self.session,
            &self.counter,
            save_flags::ONLY_IF_MODIFIED | save_flags::FLUSH_DISK_CACHE,
        );

        debug!("waiting for final resume data");
        let counter = Arc::clone(&self.counter);
        let drained =
            tokio::task::spawn_blocking(move || counter.wait_zero(SHUTDOWN_DRAIN_TIMEOUT))
                .await
                .unwrap_or(false);
        if !drained {
            error!(
                "received less resume data than expected; resume data may be \
                 incomplete"
            );
        }

        self.receiver_closer.close();
        let _ = self.receiver_task.await;
        self.writer.shutdown().await;
        if let Err(err) = self.session.dec_alert_mask(REQUIRED_MASK) {
            warn!(error = %err, "failed to release resume alert mask");
        }
        info!("resume service stopped");
    }
}

fn save(session: &SessionService, counter: &PendingCounter, handle: TorrentHandle, flags: u8) {
    match session.backend().save_resume_data(handle, flags) {
        Ok(()) => counter.inc(),
        Err(Error::InvalidHandle) => {}
        Err(err) => warn!(%handle, error = %err, "save_resume_data failed"),
    }
}

fn save_all(session: &SessionService, counter: &PendingCounter, flags: u8) {
    let handles = session.backend().torrent_handles();
    debug!(torrents = handles.len(), "saving resume data");
    for handle in handles {
        save(session, counter, handle, flags);
    }
}

async fn receiver_loop(
    mut sub: Subscription,
    session: Arc<SessionService>,
    data_dir: PathBuf,
    counter: Arc<PendingCounter>,
    jobs: std::sync::mpsc::Sender<WriteJob>,
) {
    loop {
        match sub.next().await {
            Ok(Some(alert)) => {
                handle_receiver_alert(&alert, &session, &data_dir, &counter, &jobs);
            }
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "resume receiver lost its alert stream");
                break;
            }
        }
    }
}

fn handle_receiver_alert(
    alert: &Alert,
    session: &SessionService,
    data_dir: &Path,
    counter: &PendingCounter,
    jobs: &std::sync::mpsc::Sender<WriteJob>,
) {
    match alert {
        Alert::SaveResumeData {
            handle,
            info_hash,
            resume,
            metadata,
        } => {
            // A save_resume_data answer can arrive after the torrent was
            // removed. find_torrent is synchronized with the add/remove
            // alerts, so this check prevents resurrecting a removed
            // torrent's state on the next startup.
            let in_session = session.find_torrent(*info_hash) == Some(*handle);

            if in_session {
                if let Some(metadata) = metadata {
                    let _ = jobs.send(WriteJob::Write {
                        path: torrent_path(data_dir, *info_hash),
                        data: bencode::wrap_info_dict(&metadata.info_bytes),
                    });
                }
                let mut stripped = resume.clone();
                if let Some(dict) = stripped.as_dict_mut() {
                    // The .torrent file is the canonical metainfo; keep the
                    // .resume blob small.
                    dict.remove(b"info".as_slice());
                }
                let _ = jobs.send(WriteJob::Write {
                    path: resume_data_path(data_dir, *info_hash),
                    data: stripped.encode(),
                });
            } else {
                debug!(%info_hash, "dropping resume data for removed torrent");
            }
            counter.dec();
        }
        Alert::SaveResumeDataFailed { info_hash, error, .. } => {
            debug!(%info_hash, error = %error, "save_resume_data answered with failure");
            counter.dec();
        }
        Alert::AddTorrent {
            info_hash,
            error: None,
            metadata: Some(metadata),
            ..
        } => {
            // A fetched-then-added torrent persists its metainfo right
            // away, not only on the next resume save.
            let _ = jobs.send(WriteJob::Write {
                path: torrent_path(data_dir, *info_hash),
                data: bencode::wrap_info_dict(&metadata.info_bytes),
            });
        }
        Alert::TorrentRemoved { info_hash, .. } => {
            let _ = jobs.send(WriteJob::Delete {
                path: resume_data_path(data_dir, *info_hash),
            });
            let _ = jobs.send(WriteJob::Delete {
                path: torrent_path(data_dir, *info_hash),
            });
        }
        Alert::MetadataReceived { handle } => {
            save(session, counter, *handle, save_flags::SAVE_INFO_DICT);
        }
        _ => {}
    }
}

async fn trigger_loop(
    mut sub: Subscription,
    session: Arc<SessionService>,
    counter: Arc<PendingCounter>,
) {
    loop {
        match sub.next().await {
            Ok(Some(alert)) => {
                if let Some(handle) = alert.handle() {
                    save(&session, &counter, handle, save_flags::ONLY_IF_MODIFIED);
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "resume trigger lost its alert stream");
                break;
            }
        }
    }
}

async fn periodic_loop(session: Arc<SessionService>, counter: Arc<PendingCounter>) {
    // Spread instances out so a fleet does not save in lockstep.
    let jitter = rand::rng().random_range(0..30);
    tokio::time::sleep(Duration::from_secs(jitter)).await;
    let mut interval = tokio::time::interval(SAVE_ALL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it.
    interval.tick().await;
    loop {
        interval.tick().await;
        save_all(&session, &counter, save_flags::ONLY_IF_MODIFIED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_config::Config;
    use peervod_core::bencode::Value;
    use peervod_core::{AddTorrentParams, SessionBackend, torrent_flags};
    use peervod_session::sim::SimSession;
    use peervod_test_support::{ConfigDirFixture, SyntheticTorrent};
    use std::time::Instant;

    struct Harness {
        fixture: ConfigDirFixture,
        sim: Arc<SimSession>,
        session: Arc<SessionService>,
        bus: AlertBus,
        pump: peervod_events::AlertPump,
    }

    fn harness() -> Harness {
        let fixture = ConfigDirFixture::new();
        let sim = Arc::new(SimSession::new());
        let session = Arc::new(
            SessionService::new(
                Arc::clone(&sim) as Arc<dyn SessionBackend>,
                AlertMask::NONE,
                &Config::new(),
            )
            .expect("session"),
        );
        let bus = AlertBus::new();
        let pump = bus.start_pump(session.backend(), Duration::from_millis(20));
        Harness {
            fixture,
            sim,
            session,
            bus,
            pump,
        }
    }

    fn add_torrent(harness: &Harness, torrent: &SyntheticTorrent) -> TorrentHandle {
        let meta = Arc::new(torrent.metadata.clone());
        harness.sim.add_seed(Arc::clone(&meta), torrent.content.clone());
        let mut params = AddTorrentParams::new(meta.info_hash);
        params.metadata = Some(meta);
        params.save_path = harness.fixture.downloads_dir();
        harness.session.async_add_torrent(params).expect("add");
        wait_for(|| harness.session.find_torrent(torrent.metadata.info_hash))
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = probe() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_writes_stripped_resume_and_torrent_file() -> anyhow::Result<()> {
        let harness = harness();
        let service = ResumeService::start(
            harness.fixture.path(),
            Arc::clone(&harness.session),
            &harness.bus,
        )?;
        let torrent = SyntheticTorrent::single_file(40_960, 16_384);
        let handle = add_torrent(&harness, &torrent);

        service.save(handle, save_flags::SAVE_INFO_DICT);

        let info_hash = torrent.metadata.info_hash;
        let resume_path = resume_data_path(service.data_dir(), info_hash);
        let torrent_file = torrent_path(service.data_dir(), info_hash);
        wait_for(|| resume_path.is_file().then_some(()));
        wait_for(|| torrent_file.is_file().then_some(()));

        // The .resume blob is stripped of the info dict.
        let blob = Value::decode(&std::fs::read(&resume_path)?)?;
        let dict = blob.as_dict().expect("resume blob is a dict");
        assert!(!dict.contains_key(b"info".as_slice()));

        // The .torrent file is the canonical metainfo wrapper.
        let reparsed = peervod_core::TorrentMetadata::from_torrent_bytes(&std::fs::read(
            &torrent_file,
        )?)?;
        assert_eq!(reparsed.info_hash, info_hash);

        service.shutdown().await;
        harness.pump.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removal_deletes_resume_artifacts() -> anyhow::Result<()> {
        let harness = harness();
        let service = ResumeService::start(
            harness.fixture.path(),
            Arc::clone(&harness.session),
            &harness.bus,
        )?;
        let torrent = SyntheticTorrent::single_file(40_960, 16_384);
        let handle = add_torrent(&harness, &torrent);
        let info_hash = torrent.metadata.info_hash;

        service.save(handle, 0);
        let resume_path = resume_data_path(service.data_dir(), info_hash);
        wait_for(|| resume_path.is_file().then_some(()));

        harness.session.remove_torrent(handle, false)?;
        wait_for(|| (!resume_path.is_file()).then_some(()));
        assert!(!torrent_path(service.data_dir(), info_hash).is_file());

        service.shutdown().await;
        harness.pump.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_save_answer_does_not_resurrect_removed_torrent() -> anyhow::Result<()> {
        let harness = harness();
        let service = ResumeService::start(
            harness.fixture.path(),
            Arc::clone(&harness.session),
            &harness.bus,
        )?;
        let torrent = SyntheticTorrent::single_file(16_384, 16_384);
        let info_hash = torrent.metadata.info_hash;
        let stale = TorrentHandle { info_hash, id: 99 };

        // Simulate the save answer arriving after torrent_removed: the
        // handle is no longer in the session.
        harness.bus.publish(Alert::SaveResumeData {
            handle: stale,
            info_hash,
            resume: Value::Dict(Default::default()),
            metadata: Some(Arc::new(torrent.metadata.clone())),
        });

        // Give the pipeline a moment, then confirm nothing was written.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!resume_data_path(service.data_dir(), info_hash).is_file());
        assert!(!torrent_path(service.data_dir(), info_hash).is_file());

        service.shutdown().await;
        harness.pump.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn storage_alerts_trigger_only_if_modified_saves() -> anyhow::Result<()> {
        let harness = harness();
        let service = ResumeService::start(
            harness.fixture.path(),
            Arc::clone(&harness.session),
            &harness.bus,
        )?;
        let torrent = SyntheticTorrent::single_file(16_384, 16_384);
        let handle = add_torrent(&harness, &torrent);

        harness.sim.trigger_cache_flushed(handle);
        let resume_path = resume_data_path(service.data_dir(), torrent.metadata.info_hash);
        wait_for(|| resume_path.is_file().then_some(()));

        service.shutdown().await;
        harness.pump.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_add_flag_not_set_by_default() -> anyhow::Result<()> {
        // DUPLICATE_IS_ERROR must stay clear for re-adds to dedup in the
        // engine's own ordering.
        assert_eq!(torrent_flags::DEFAULT & torrent_flags::DUPLICATE_IS_ERROR, 0);
        Ok(())
    }
}
