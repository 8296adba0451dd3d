//! The single-writer thread behind all resume-file mutations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, error};

/// A unit of filesystem work. Jobs execute strictly in submission order, so
/// writes and deletes for the same infohash are serialized.
pub(crate) enum WriteJob {
    /// Atomically replace `path` with `data`.
    Write { path: PathBuf, data: Vec<u8> },
    /// Delete `path`; a missing file is success.
    Delete { path: PathBuf },
}

pub(crate) struct Writer {
    tx: Option<mpsc::Sender<WriteJob>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Writer {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let thread = thread::Builder::new()
            .name("resume-writer".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    run_job(job);
                }
                debug!("resume writer drained");
            })
            .ok();
        if thread.is_none() {
            error!("failed to spawn resume writer thread");
        }
        Self {
            tx: Some(tx),
            thread,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<WriteJob> {
        self.tx.clone().expect("writer sender available until shutdown")
    }

    /// Close the queue and wait for queued jobs to finish.
    pub(crate) async fn shutdown(mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

fn run_job(job: WriteJob) {
    match job {
        WriteJob::Write { path, data } => {
            if let Err(err) = write_atomic(&path, &data) {
                error!(path = %path.display(), error = %err, "resume write failed");
            } else {
                debug!(path = %path.display(), bytes = data.len(), "wrote");
            }
        }
        WriteJob::Delete { path } => match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "deleted"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => error!(path = %path.display(), error = %err, "resume delete failed"),
        },
    }
}

/// Write via `<file>.tmp` and rename; the rename is atomic on the
/// platforms we care about. The tmp file is removed on failure.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let result = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path));
    if result.is_err()
        && let Err(err) = fs::remove_file(&tmp)
        && err.kind() != io::ErrorKind::NotFound
    {
        error!(path = %tmp.display(), error = %err, "failed to clean up tmp file");
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_atomic_and_ordered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("deadbeef.resume");
        let writer = Writer::spawn();
        let tx = writer.sender();

        tx.send(WriteJob::Write {
            path: target.clone(),
            data: b"first".to_vec(),
        })?;
        tx.send(WriteJob::Write {
            path: target.clone(),
            data: b"second".to_vec(),
        })?;
        drop(tx);
        writer.shutdown().await;

        assert_eq!(std::fs::read(&target)?, b"second");
        assert!(!tmp_path(&target).exists(), "tmp file must not linger");
        Ok(())
    }

    #[tokio::test]
    async fn delete_of_missing_file_is_success() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = Writer::spawn();
        writer.sender().send(WriteJob::Delete {
            path: dir.path().join("absent.torrent"),
        })?;
        writer.shutdown().await;
        Ok(())
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/a/b/c.resume")),
            PathBuf::from("/a/b/c.resume.tmp")
        );
    }
}
