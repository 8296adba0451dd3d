#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Download accounting: attributes newly-verified piece bytes to the user
//! whose request most likely caused them, aggregated per
//! `(user, tracker, infohash, generation)`.
//!
//! The request engine reports two event kinds: a piece event for each
//! verified piece (with the blamed request's identity, or no blame when no
//! request intersected the piece) and periodic presence snapshots.
//! Generations advance when a torrent transitions from absent to present
//! between snapshots, which keeps bytes from repeated add/remove cycles
//! distinguishable.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use peervod_core::{Error, InfoHash, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// User recorded when no request could be blamed for a piece.
pub const USER_UNKNOWN: &str = "unknown";
/// Tracker recorded when the blamed request carried none.
pub const TRACKER_UNKNOWN: &str = "";

/// Snapshot file name within the config directory.
pub const SNAPSHOT_FILENAME: &str = "acct.json";

/// Identity of the request blamed for a downloaded piece.
#[derive(Debug, Clone)]
pub struct Blame {
    /// Originating user.
    pub user: String,
    /// Tracker the request came through, if known.
    pub tracker: Option<String>,
    /// When the blamed request was created; becomes the record's `atime`.
    pub requested_at: SystemTime,
}

/// Events the request engine posts to accounting.
#[derive(Debug, Clone)]
pub enum AcctEvent {
    /// A piece finished downloading and passed its hash check.
    Piece {
        /// Torrent the piece belongs to.
        info_hash: InfoHash,
        /// Size of the piece.
        num_bytes: u64,
        /// Blamed request, or `None` for the unknown sentinel.
        blame: Option<Blame>,
    },
    /// The set of torrents currently present in the engine.
    Presence {
        /// All present infohashes.
        info_hashes: Vec<InfoHash>,
    },
}

/// Send half used by the request engine.
pub type AcctSink = mpsc::UnboundedSender<AcctEvent>;

/// One aggregation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcctKey {
    /// Originating user (or [`USER_UNKNOWN`]).
    pub user: String,
    /// Tracker name (or [`TRACKER_UNKNOWN`]).
    pub tracker: String,
    /// Torrent identity.
    pub info_hash: InfoHash,
    /// Add/remove cycle the bytes belong to.
    pub generation: u64,
}

/// A rolled-up accounting row. Fields not in the `group_by` set are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctTotals {
    /// Grouped user, if grouped by user.
    pub user: Option<String>,
    /// Grouped tracker, if grouped by tracker.
    pub tracker: Option<String>,
    /// Grouped torrent, if grouped by infohash.
    pub info_hash: Option<InfoHash>,
    /// Grouped generation, if grouped by generation.
    pub generation: Option<u64>,
    /// Sum of bytes attributed to the group.
    pub num_bytes: u64,
    /// Maximum access time within the group.
    pub atime: DateTime<Utc>,
}

/// Which key fields to roll up by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupBy {
    /// Group by user.
    pub user: bool,
    /// Group by tracker.
    pub tracker: bool,
    /// Group by infohash.
    pub info_hash: bool,
    /// Group by generation.
    pub generation: bool,
}

impl GroupBy {
    /// Group by every key field (no roll-up).
    #[must_use]
    pub const fn all() -> Self {
        Self {
            user: true,
            tracker: true,
            info_hash: true,
            generation: true,
        }
    }
}

/// Equality filters over key fields.
#[derive(Debug, Clone, Default)]
pub struct AcctFilter {
    /// Match this user only.
    pub user: Option<String>,
    /// Match this tracker only.
    pub tracker: Option<String>,
    /// Match this torrent only.
    pub info_hash: Option<InfoHash>,
    /// Match this generation only.
    pub generation: Option<u64>,
}

impl AcctFilter {
    fn matches(&self, key: &AcctKey) -> bool {
        self.user.as_deref().is_none_or(|user| key.user == user)
            && self
                .tracker
                .as_deref()
                .is_none_or(|tracker| key.tracker == tracker)
            && self.info_hash.is_none_or(|hash| key.info_hash == hash)
            && self
                .generation
                .is_none_or(|generation| key.generation == generation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    key: AcctKey,
    num_bytes: u64,
    atime: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GenerationMeta {
    generation: u64,
    present: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<StoredRecord>,
    generations: HashMap<InfoHash, GenerationMeta>,
}

#[derive(Default)]
struct AcctState {
    records: HashMap<AcctKey, (u64, DateTime<Utc>)>,
    generations: HashMap<InfoHash, GenerationMeta>,
    dirty: bool,
}

impl AcctState {
    fn apply(&mut self, event: AcctEvent) {
        match event {
            AcctEvent::Piece {
                info_hash,
                num_bytes,
                blame,
            } => {
                let generation = self
                    .generations
                    .get(&info_hash)
                    .map_or(0, |meta| meta.generation);
                let (user, tracker, atime) = match blame {
                    Some(blame) => (
                        blame.user,
                        blame.tracker.unwrap_or_else(|| TRACKER_UNKNOWN.to_owned()),
                        DateTime::<Utc>::from(blame.requested_at),
                    ),
                    None => (
                        USER_UNKNOWN.to_owned(),
                        TRACKER_UNKNOWN.to_owned(),
                        Utc::now(),
                    ),
                };
                let key = AcctKey {
                    user,
                    tracker,
                    info_hash,
                    generation,
                };
                let entry = self.records.entry(key).or_insert((0, atime));
                entry.0 += num_bytes;
                entry.1 = entry.1.max(atime);
                self.dirty = true;
            }
            AcctEvent::Presence { info_hashes } => {
                let present: std::collections::HashSet<InfoHash> =
                    info_hashes.into_iter().collect();
                for info_hash in &present {
                    let meta = self.generations.entry(*info_hash).or_insert(GenerationMeta {
                        generation: 0,
                        present: false,
                    });
                    if !meta.present {
                        meta.generation += 1;
                        meta.present = true;
                        self.dirty = true;
                        debug!(%info_hash, generation = meta.generation, "torrent generation advanced");
                    }
                }
                for (info_hash, meta) in &mut self.generations {
                    if meta.present && !present.contains(info_hash) {
                        meta.present = false;
                        self.dirty = true;
                    }
                }
            }
        }
    }

    fn query(&self, group_by: GroupBy, filter: &AcctFilter) -> Vec<AcctTotals> {
        let mut grouped: HashMap<
            (Option<String>, Option<String>, Option<InfoHash>, Option<u64>),
            (u64, DateTime<Utc>),
        > = HashMap::new();
        for (key, (num_bytes, atime)) in &self.records {
            if !filter.matches(key) {
                continue;
            }
            let group = (
                group_by.user.then(|| key.user.clone()),
                group_by.tracker.then(|| key.tracker.clone()),
                group_by.info_hash.then_some(key.info_hash),
                group_by.generation.then_some(key.generation),
            );
            let entry = grouped.entry(group).or_insert((0, *atime));
            entry.0 += num_bytes;
            entry.1 = entry.1.max(*atime);
        }
        let mut totals: Vec<AcctTotals> = grouped
            .into_iter()
            .map(|((user, tracker, info_hash, generation), (num_bytes, atime))| AcctTotals {
                user,
                tracker,
                info_hash,
                generation,
                num_bytes,
                atime,
            })
            .collect();
        totals.sort_by(|a, b| {
            (&a.user, &a.tracker, a.info_hash, a.generation).cmp(&(
                &b.user,
                &b.tracker,
                b.info_hash,
                b.generation,
            ))
        });
        totals
    }
}

/// The accounting service: consumes events, answers queries, persists a
/// JSON snapshot.
pub struct AcctService {
    state: Arc<Mutex<AcctState>>,
    sink: AcctSink,
    task: JoinHandle<()>,
    snapshot_path: PathBuf,
}

/// How often the snapshot is flushed while dirty.
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

impl AcctService {
    /// Load any existing snapshot and start the consumer task. Must run
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if an existing snapshot cannot be parsed.
    pub fn start(config_dir: &Path) -> Result<Self> {
        let snapshot_path = config_dir.join(SNAPSHOT_FILENAME);
        let mut state = AcctState::default();
        match fs::read(&snapshot_path) {
            Ok(data) => {
                let snapshot: Snapshot = serde_json::from_slice(&data)
                    .map_err(|err| Error::Storage(format!("parsing accounting snapshot: {err}")))?;
                for record in snapshot.records {
                    state
                        .records
                        .insert(record.key, (record.num_bytes, record.atime));
                }
                state.generations = snapshot.generations;
                // Presence does not survive restarts; every torrent starts
                // absent so its next appearance advances the generation.
                for meta in state.generations.values_mut() {
                    meta.present = false;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(error = %err, "could not read accounting snapshot; starting empty");
            }
        }

        let state = Arc::new(Mutex::new(state));
        let (sink, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(consumer_loop(
            Arc::clone(&state),
            rx,
            snapshot_path.clone(),
        ));
        Ok(Self {
            state,
            sink,
            task,
            snapshot_path,
        })
    }

    /// The sender handed to the request engine.
    #[must_use]
    pub fn sink(&self) -> AcctSink {
        self.sink.clone()
    }

    /// Aggregate matching records, rolled up by `group_by`.
    #[must_use]
    pub fn get(&self, group_by: GroupBy, filter: &AcctFilter) -> Vec<AcctTotals> {
        lock(&self.state).query(group_by, filter)
    }

    /// The current generation of a torrent (0 when never seen).
    #[must_use]
    pub fn generation(&self, info_hash: InfoHash) -> u64 {
        lock(&self.state)
            .generations
            .get(&info_hash)
            .map_or(0, |meta| meta.generation)
    }

    /// Stop the consumer and write a final snapshot.
    pub async fn shutdown(self) {
        drop(self.sink);
        let _ = self.task.await;
        flush(&self.state, &self.snapshot_path);
    }
}

async fn consumer_loop(
    state: Arc<Mutex<AcctState>>,
    mut rx: mpsc::UnboundedReceiver<AcctEvent>,
    snapshot_path: PathBuf,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => lock(&state).apply(event),
                None => break,
            },
            _ = interval.tick() => flush(&state, &snapshot_path),
        }
    }
}

fn flush(state: &Mutex<AcctState>, snapshot_path: &Path) {
    let snapshot = {
        let mut state = lock(state);
        if !state.dirty {
            return;
        }
        state.dirty = false;
        Snapshot {
            records: state
                .records
                .iter()
                .map(|(key, (num_bytes, atime))| StoredRecord {
                    key: key.clone(),
                    num_bytes: *num_bytes,
                    atime: *atime,
                })
                .collect(),
            generations: state.generations.clone(),
        }
    };
    let data = match serde_json::to_vec_pretty(&snapshot) {
        Ok(data) => data,
        Err(err) => {
            error!(error = %err, "failed to encode accounting snapshot");
            return;
        }
    };
    let tmp = snapshot_path.with_extension("json.tmp");
    let result = fs::write(&tmp, &data).and_then(|()| fs::rename(&tmp, snapshot_path));
    if let Err(err) = result {
        error!(error = %err, "failed to write accounting snapshot");
        let _ = fs::remove_file(&tmp);
    }
}

fn lock(state: &Mutex<AcctState>) -> MutexGuard<'_, AcctState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn piece(info_hash: InfoHash, bytes: u64, user: &str) -> AcctEvent {
        AcctEvent::Piece {
            info_hash,
            num_bytes: bytes,
            blame: Some(Blame {
                user: user.to_owned(),
                tracker: Some("example".to_owned()),
                requested_at: SystemTime::now(),
            }),
        }
    }

    #[test]
    fn aggregates_by_key_and_accumulates_bytes() {
        let mut state = AcctState::default();
        state.apply(AcctEvent::Presence {
            info_hashes: vec![hash(1)],
        });
        state.apply(piece(hash(1), 100, "alice"));
        state.apply(piece(hash(1), 50, "alice"));
        state.apply(piece(hash(1), 10, "bob"));

        let totals = state.query(GroupBy::all(), &AcctFilter::default());
        assert_eq!(totals.len(), 2);
        let alice = totals.iter().find(|t| t.user.as_deref() == Some("alice")).unwrap();
        assert_eq!(alice.num_bytes, 150);
        assert_eq!(alice.generation, Some(1));
    }

    #[test]
    fn unknown_blame_uses_sentinel_user() {
        let mut state = AcctState::default();
        state.apply(AcctEvent::Piece {
            info_hash: hash(2),
            num_bytes: 42,
            blame: None,
        });
        let totals = state.query(GroupBy::all(), &AcctFilter::default());
        assert_eq!(totals[0].user.as_deref(), Some(USER_UNKNOWN));
        assert_eq!(totals[0].generation, Some(0));
    }

    #[test]
    fn generation_advances_on_absent_to_present() {
        let mut state = AcctState::default();
        state.apply(AcctEvent::Presence {
            info_hashes: vec![hash(3)],
        });
        assert_eq!(state.generations[&hash(3)].generation, 1);
        // Still present: no advance.
        state.apply(AcctEvent::Presence {
            info_hashes: vec![hash(3)],
        });
        assert_eq!(state.generations[&hash(3)].generation, 1);
        // Absent, then present again: advance.
        state.apply(AcctEvent::Presence {
            info_hashes: vec![],
        });
        state.apply(AcctEvent::Presence {
            info_hashes: vec![hash(3)],
        });
        assert_eq!(state.generations[&hash(3)].generation, 2);
    }

    #[test]
    fn rollup_and_filters() {
        let mut state = AcctState::default();
        state.apply(piece(hash(1), 10, "alice"));
        state.apply(piece(hash(2), 20, "alice"));
        state.apply(piece(hash(2), 5, "bob"));

        let by_user = state.query(
            GroupBy {
                user: true,
                ..GroupBy::default()
            },
            &AcctFilter::default(),
        );
        assert_eq!(by_user.len(), 2);
        let alice = by_user.iter().find(|t| t.user.as_deref() == Some("alice")).unwrap();
        assert_eq!(alice.num_bytes, 30);
        assert_eq!(alice.info_hash, None);

        let only_two = state.query(
            GroupBy::all(),
            &AcctFilter {
                info_hash: Some(hash(2)),
                ..AcctFilter::default()
            },
        );
        assert_eq!(only_two.iter().map(|t| t.num_bytes).sum::<u64>(), 25);
    }
    #[tokio::test]
    async fn snapshot_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = AcctService::start(dir.path())?;
        let sink = service.sink();
        sink.send(AcctEvent::Presence {
            info_hashes: vec![hash(7)],
        })?;
        sink.send(piece(hash(7), 1_000, "carol"))?;
        service.shutdown().await;

        let restored = AcctService::start(dir.path())?;
        let totals = restored.get(GroupBy::all(), &AcctFilter::default());
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].num_bytes, 1_000);
        assert_eq!(restored.generation(hash(7)), 1);
        // A fresh presence snapshot advances the generation: the torrent was
        // absent across the restart.
        let sink = restored.sink();
        sink.send(AcctEvent::Presence {
            info_hashes: vec![hash(7)],
        })?;
        restored.shutdown().await;
        Ok(())
    }
}
