//! Service graph construction and lifecycle.
//!
//! Order matters in both directions: services come up leaves-first
//! (session, bus, accounting, engine, resume, vfs) and go down in
//! reverse — requests stop first, the session pauses, resume data flushes
//! last.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use peervod_acct::AcctService;
use peervod_config::Config;
use peervod_core::{AlertMask, SessionBackend};
use peervod_events::{AlertBus, AlertPump};
use peervod_io::RequestEngine;
use peervod_resume::{ResumeService, iter_resume_data};
use peervod_session::SessionService;
use peervod_session::sim::SimSession;
use peervod_vfs::Vfs;
use tracing::{error, info, warn};

use crate::AppError;

/// How long alert retrieval blocks in the engine, bounding shutdown
/// latency.
const ALERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The assembled application graph.
pub struct App {
    config_dir: std::path::PathBuf,
    session: Arc<SessionService>,
    bus: AlertBus,
    pump: Option<AlertPump>,
    acct: Option<AcctService>,
    engine: Arc<RequestEngine>,
    resume: Option<ResumeService>,
    vfs: Vfs,
}

impl App {
    /// Build every service against the given config directory and restore
    /// persisted torrents.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when startup configuration is
    /// rejected; startup aborts rather than running half-configured.
    pub fn assemble(config_dir: &Path, backend: Arc<dyn SessionBackend>) -> Result<Self, AppError> {
        std::fs::create_dir_all(config_dir)?;
        let config = Config::from_dir(config_dir)?;

        let session = Arc::new(SessionService::new(backend, AlertMask::NONE, &config)?);
        let bus = AlertBus::new();
        let pump = bus.start_pump(session.backend(), ALERT_POLL_INTERVAL);

        let acct = AcctService::start(config_dir)?;
        let engine = RequestEngine::start(
            Arc::clone(&session),
            &bus,
            Some(acct.sink()),
            &config,
            config_dir,
        )?;

        // Re-hydrate persisted torrents before the resume service starts
        // observing, so their first saves reflect restored state.
        let mut restored = 0_usize;
        for atp in iter_resume_data(config_dir) {
            let info_hash = atp.info_hash;
            match engine.add_torrent(atp) {
                Ok(()) => restored += 1,
                Err(err) => warn!(%info_hash, error = %err, "failed to restore torrent"),
            }
        }
        if restored > 0 {
            info!(restored, "restored torrents from resume data");
        }

        let resume = ResumeService::start(config_dir, Arc::clone(&session), &bus)?;
        let vfs = Vfs::new();

        info!(config_dir = %config_dir.display(), "peervod assembled");
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            session,
            bus,
            pump: Some(pump),
            acct: Some(acct),
            engine,
            resume: Some(resume),
            vfs,
        })
    }

    /// The virtual filesystem; the host registers providers and front ends
    /// against it.
    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The request engine, for front ends opening readers.
    #[must_use]
    pub fn engine(&self) -> &Arc<RequestEngine> {
        &self.engine
    }

    /// The alert bus, for additional observers.
    #[must_use]
    pub fn bus(&self) -> &AlertBus {
        &self.bus
    }

    /// Accounting queries.
    #[must_use]
    pub fn acct(&self) -> Option<&AcctService> {
        self.acct.as_ref()
    }

    /// Reload `config.json` and re-apply it. A rejected config leaves the
    /// running configuration untouched.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] with the rejection reason.
    pub fn reload_config(&self) -> Result<(), AppError> {
        let config = Config::from_dir(&self.config_dir)?;
        // Validate both stages before applying either would require
        // transactional staging across services; each service validates
        // fully before touching its own state, so a failure here leaves
        // the earlier service re-applied and the later one untouched.
        self.session.set_config(&config)?;
        self.engine.set_config(&config)?;
        info!("configuration reloaded");
        Ok(())
    }

    /// Graceful shutdown in reverse dependency order.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        // 1. Stop serving requests; readers unblock with cancellation.
        self.engine.shutdown().await;
        // 2. No new downloads or uploads.
        self.session.pause();
        // 3. Final resume flush; waits up to its drain timeout.
        if let Some(resume) = self.resume.take() {
            resume.shutdown().await;
        }
        // 4. Accounting snapshot.
        if let Some(acct) = self.acct.take() {
            acct.shutdown().await;
        }
        // 5. Stop the alert pump last; everything above relied on it.
        if let Some(pump) = self.pump.take() {
            let _ = tokio::task::spawn_blocking(move || pump.shutdown()).await;
        }
        info!("shutdown complete");
    }
}

/// Run the application until SIGTERM/SIGINT, reloading config on SIGHUP.
///
/// # Errors
///
/// Returns [`AppError`] if startup fails; runtime errors only log.
pub async fn run_app(config_dir: &Path) -> Result<(), AppError> {
    crate::telemetry::init()?;
    let backend: Arc<dyn SessionBackend> = Arc::new(SimSession::new());
    let app = App::assemble(config_dir, backend)?;
    wait_for_shutdown(&app).await;
    app.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(app: &App) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGHUP handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP: reloading configuration");
                if let Err(err) = app.reload_config() {
                    error!(error = %err, "config reload rejected");
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down");
                return;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "ctrl-c handler failed");
                }
                info!("SIGINT: shutting down");
                return;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_app: &App) {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt: shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_core::{InfoHash, TorrentSlice};
    use peervod_io::{MetainfoSource, RequestMode, RequestParams};
    use peervod_test_support::SyntheticTorrent;
    use serde_json::json;
    use std::io::Read;

    fn backend_with(torrent: &SyntheticTorrent) -> Arc<SimSession> {
        let sim = Arc::new(SimSession::new());
        sim.add_seed(Arc::new(torrent.metadata.clone()), torrent.content.clone());
        sim
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn assemble_read_and_shutdown_round_trip() -> anyhow::Result<()> {
        crate::telemetry::init_for_tests();
        let dir = tempfile::tempdir()?;
        let torrent = SyntheticTorrent::single_file(49_152, 16_384);
        let sim = backend_with(&torrent);

        let app = App::assemble(dir.path(), Arc::clone(&sim) as Arc<dyn SessionBackend>)?;
        let bytes = torrent.torrent_bytes();
        let mut reader = app.engine().open(
            TorrentSlice::new(torrent.metadata.info_hash, 0, torrent.metadata.total_length),
            MetainfoSource::Metainfo(Arc::new(move || Ok(bytes.clone()))),
            "alice",
            None,
        );
        let content = torrent.content.clone();
        tokio::task::spawn_blocking(move || {
            let mut collected = Vec::new();
            reader.read_to_end(&mut collected).expect("read");
            assert_eq!(collected, content);
        })
        .await?;

        app.shutdown().await;

        // The resume directory now holds the torrent's artifacts, so a
        // second life restores it.
        let restored: Vec<_> = iter_resume_data(dir.path()).collect();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].info_hash, torrent.metadata.info_hash);

        let sim2 = Arc::new(SimSession::new());
        let app = App::assemble(dir.path(), Arc::clone(&sim2) as Arc<dyn SessionBackend>)?;
        assert!(app.engine().has_torrent(torrent.metadata.info_hash));
        app.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reload_rejects_bad_config_and_keeps_running() -> anyhow::Result<()> {
        crate::telemetry::init_for_tests();
        let dir = tempfile::tempdir()?;
        let app = App::assemble(
            dir.path(),
            Arc::new(SimSession::new()) as Arc<dyn SessionBackend>,
        )?;

        let mut config = Config::new();
        config.set("session_warp_factor", json!(9));
        config.write_dir(dir.path())?;
        assert!(app.reload_config().is_err());

        let mut config = Config::new();
        config.set("session_connections_limit", json!(77));
        config.write_dir(dir.path())?;
        app.reload_config()?;

        app.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_requests_unblock_during_shutdown() -> anyhow::Result<()> {
        crate::telemetry::init_for_tests();
        let dir = tempfile::tempdir()?;
        // No seed anywhere: the read can never complete.
        let app = App::assemble(
            dir.path(),
            Arc::new(SimSession::new()) as Arc<dyn SessionBackend>,
        )?;
        let request = app.engine().add_request(RequestParams::new(
            TorrentSlice::new(InfoHash::new([9; 20]), 0, 1_000),
            RequestMode::Read,
            "alice",
            MetainfoSource::Magnet {
                trackers: Vec::new(),
            },
        ));
        let waiter = tokio::task::spawn_blocking(move || request.next_chunk(None));
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.shutdown().await;

        let result = waiter.await?;
        assert!(matches!(result, Err(peervod_core::Error::Cancelled(_))));
        Ok(())
    }
}
