#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! The alert bus: multiplexes the engine's single, strictly ordered alert
//! stream to any number of filtered subscribers.
//!
//! One pump thread owns the consumer side of the engine
//! ([`SessionBackend::wait_for_alerts`]) and fans alerts out to
//! per-subscription bounded queues. A subscription created at sequence `T`
//! never misses an alert posted at or after `T` that matches its filter;
//! alerts are delivered in source order; a subscription that stops
//! consuming gets a terminal [`Error::AlertOverflow`] without affecting
//! anyone else.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use peervod_core::{Alert, AlertKind, Error, InfoHash, Result, SessionBackend};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Default number of alerts kept for replay cursors.
const DEFAULT_RING_CAPACITY: usize = 8_192;
/// Default per-subscription queue depth.
const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

/// Monotonic position in the alert stream.
pub type AlertSeq = u64;

/// Predicate selecting which alerts a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    kinds: Option<HashSet<AlertKind>>,
    torrent: Option<InfoHash>,
}

impl AlertFilter {
    /// A filter matching every alert.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given alert kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: &[AlertKind]) -> Self {
        self.kinds = Some(kinds.iter().copied().collect());
        self
    }

    /// Restrict to alerts pertaining to one torrent.
    #[must_use]
    pub fn torrent(mut self, info_hash: InfoHash) -> Self {
        self.torrent = Some(info_hash);
        self
    }

    fn matches(&self, alert: &Alert) -> bool {
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&alert.kind())
        {
            return false;
        }
        if let Some(torrent) = self.torrent
            && alert.info_hash() != torrent
        {
            return false;
        }
        true
    }
}

struct SubEntry {
    id: u64,
    filter: AlertFilter,
    tx: mpsc::Sender<(AlertSeq, Arc<Alert>)>,
    overflowed: Arc<AtomicBool>,
}

struct BusInner {
    next_seq: AtomicU64,
    next_sub_id: AtomicU64,
    ring: Mutex<Ring>,
    subs: Mutex<Vec<SubEntry>>,
    ring_capacity: usize,
    queue_capacity: usize,
}

struct Ring {
    entries: VecDeque<(AlertSeq, Arc<Alert>)>,
    evicted_through: AlertSeq,
}

/// Shared alert distribution hub. Clones refer to the same bus.
#[derive(Clone)]
pub struct AlertBus {
    inner: Arc<BusInner>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBus {
    /// A bus with default ring and queue capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }

    /// A bus with explicit replay-ring and per-subscription capacities.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero.
    #[must_use]
    pub fn with_capacity(ring_capacity: usize, queue_capacity: usize) -> Self {
        assert!(ring_capacity > 0, "ring capacity must be positive");
        assert!(queue_capacity > 0, "queue capacity must be positive");
        Self {
            inner: Arc::new(BusInner {
                next_seq: AtomicU64::new(1),
                next_sub_id: AtomicU64::new(1),
                ring: Mutex::new(Ring {
                    entries: VecDeque::with_capacity(ring_capacity),
                    evicted_through: 0,
                }),
                subs: Mutex::new(Vec::new()),
                ring_capacity,
                queue_capacity,
            }),
        }
    }

    /// The sequence number of the most recently published alert.
    ///
    /// Grab this *before* issuing an engine action, then subscribe with it
    /// as the cursor to observe every alert the action produces.
    #[must_use]
    pub fn current_seq(&self) -> AlertSeq {
        self.inner.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Publish one alert to all matching subscriptions.
    pub fn publish(&self, alert: Alert) -> AlertSeq {
        self.publish_arc(Arc::new(alert))
    }

    fn publish_arc(&self, alert: Arc<Alert>) -> AlertSeq {
        // Lock order: ring, then subs. Subscribe takes the same pair, which
        // makes "no alert missed at or after subscribe" hold exactly.
        let mut ring = lock(&self.inner.ring);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        if ring.entries.len() == self.inner.ring_capacity {
            if let Some((evicted, _)) = ring.entries.pop_front() {
                ring.evicted_through = evicted;
            }
        }
        ring.entries.push_back((seq, Arc::clone(&alert)));

        let mut subs = lock(&self.inner.subs);
        subs.retain(|entry| {
            if !entry.filter.matches(&alert) {
                return true;
            }
            match entry.tx.try_send((seq, Arc::clone(&alert))) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(sub = entry.id, seq, "subscription overflowed, dropping it");
                    entry.overflowed.store(true, Ordering::SeqCst);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        seq
    }

    /// Open a subscription.
    ///
    /// With `since`, buffered alerts after that cursor are replayed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlertOverflow`] if `since` falls before the replay
    /// window; resuming from there could silently skip alerts.
    pub fn subscribe(&self, filter: AlertFilter, since: Option<AlertSeq>) -> Result<Subscription> {
        let ring = lock(&self.inner.ring);
        let mut backlog = VecDeque::new();
        if let Some(since) = since {
            if since < ring.evicted_through {
                return Err(Error::AlertOverflow);
            }
            for (seq, alert) in &ring.entries {
                if *seq > since && filter.matches(alert) {
                    backlog.push_back((*seq, Arc::clone(alert)));
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subs).push(SubEntry {
            id,
            filter,
            tx,
            overflowed: Arc::clone(&overflowed),
        });
        drop(ring);

        Ok(Subscription {
            backlog,
            rx,
            closer: SubscriptionCloser {
                bus: Arc::downgrade(&self.inner),
                id,
            },
            overflowed,
            finished: false,
        })
    }

    fn close_subscription(&self, id: u64) {
        lock(&self.inner.subs).retain(|entry| entry.id != id);
    }

    /// Spawn the pump thread that drains the engine and feeds this bus.
    ///
    /// `poll_interval` bounds how long the pump blocks in the engine, which
    /// in turn bounds shutdown latency.
    #[must_use]
    pub fn start_pump(
        &self,
        backend: Arc<dyn SessionBackend>,
        poll_interval: Duration,
    ) -> AlertPump {
        let bus = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("alert-pump".into())
            .spawn(move || {
                debug!("alert pump started");
                loop {
                    let alerts = backend.wait_for_alerts(poll_interval);
                    if alerts.is_empty() && stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    for alert in alerts {
                        bus.publish_arc(alert);
                    }
                }
                debug!("alert pump stopped");
            });
        match thread {
            Ok(handle) => AlertPump {
                stop,
                thread: Some(handle),
            },
            Err(err) => {
                error!(error = %err, "failed to spawn alert pump thread");
                AlertPump { stop, thread: None }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("alert bus mutex poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}

/// Owner of the pump thread. Dropping without [`AlertPump::shutdown`]
/// detaches the thread.
pub struct AlertPump {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AlertPump {
    /// Signal the pump to stop once the engine's queue is drained, and wait
    /// for it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("alert pump thread panicked");
        }
    }
}

/// Closes a subscription from anywhere; close is idempotent and unblocks a
/// waiting iterator.
#[derive(Clone)]
pub struct SubscriptionCloser {
    bus: std::sync::Weak<BusInner>,
    id: u64,
}

impl SubscriptionCloser {
    /// Close the subscription.
    pub fn close(&self) {
        if let Some(inner) = self.bus.upgrade() {
            AlertBus { inner }.close_subscription(self.id);
        }
    }
}

/// One subscriber's ordered view of the alert stream.
pub struct Subscription {
    backlog: VecDeque<(AlertSeq, Arc<Alert>)>,
    rx: mpsc::Receiver<(AlertSeq, Arc<Alert>)>,
    closer: SubscriptionCloser,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

impl Subscription {
    /// Next matching alert, in source order.
    ///
    /// Returns `Ok(None)` once the subscription is closed and drained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlertOverflow`] (terminally) if this subscriber
    /// fell behind and the bus dropped it.
    pub async fn next(&mut self) -> Result<Option<Arc<Alert>>> {
        if self.finished {
            return Ok(None);
        }
        if let Some((_, alert)) = self.backlog.pop_front() {
            return Ok(Some(alert));
        }
        match self.rx.recv().await {
            Some((_, alert)) => Ok(Some(alert)),
            None => {
                self.finished = true;
                if self.overflowed.load(Ordering::SeqCst) {
                    Err(Error::AlertOverflow)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlertOverflow`] (terminally) if this subscriber
    /// fell behind and the bus dropped it.
    pub fn try_next(&mut self) -> Result<Option<Arc<Alert>>> {
        if self.finished {
            return Ok(None);
        }
        if let Some((_, alert)) = self.backlog.pop_front() {
            return Ok(Some(alert));
        }
        match self.rx.try_recv() {
            Ok((_, alert)) => Ok(Some(alert)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finished = true;
                if self.overflowed.load(Ordering::SeqCst) {
                    Err(Error::AlertOverflow)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// A handle that can close this subscription from another task.
    #[must_use]
    pub fn closer(&self) -> SubscriptionCloser {
        self.closer.clone()
    }

    /// Close this subscription. Idempotent.
    pub fn close(&self) {
        self.closer.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_core::TorrentHandle;
    use tokio::time::timeout;

    fn handle(byte: u8) -> TorrentHandle {
        TorrentHandle {
            info_hash: InfoHash::new([byte; 20]),
            id: 1,
        }
    }

    fn piece_alert(byte: u8, piece: u32) -> Alert {
        Alert::PieceFinished {
            handle: handle(byte),
            piece,
        }
    }

    #[tokio::test]
    async fn delivers_in_source_order() -> anyhow::Result<()> {
        let bus = AlertBus::new();
        let mut sub = bus.subscribe(AlertFilter::all(), None)?;
        for piece in 0..5 {
            bus.publish(piece_alert(1, piece));
        }
        for piece in 0..5 {
            let alert = sub.next().await?.expect("alert expected");
            match alert.as_ref() {
                Alert::PieceFinished { piece: got, .. } => assert_eq!(*got, piece),
                other => panic!("unexpected alert {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn kind_and_torrent_filters_apply() -> anyhow::Result<()> {
        let bus = AlertBus::new();
        let mut sub = bus.subscribe(
            AlertFilter::all()
                .kinds(&[AlertKind::PieceFinished])
                .torrent(InfoHash::new([1; 20])),
            None,
        )?;
        bus.publish(piece_alert(2, 0));
        bus.publish(Alert::TorrentPaused { handle: handle(1) });
        bus.publish(piece_alert(1, 7));
        let alert = sub.next().await?.expect("alert expected");
        assert!(matches!(
            alert.as_ref(),
            Alert::PieceFinished { piece: 7, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn cursor_replays_missed_alerts() -> anyhow::Result<()> {
        let bus = AlertBus::new();
        let cursor = bus.current_seq();
        // Alerts published between taking the cursor and subscribing are
        // replayed, closing the subscribe-after-action race.
        bus.publish(piece_alert(1, 0));
        bus.publish(piece_alert(1, 1));
        let mut sub = bus.subscribe(AlertFilter::all(), Some(cursor))?;
        bus.publish(piece_alert(1, 2));
        for expected in 0..3 {
            let alert = sub.next().await?.expect("alert expected");
            match alert.as_ref() {
                Alert::PieceFinished { piece, .. } => assert_eq!(*piece, expected),
                other => panic!("unexpected alert {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn stale_cursor_is_rejected() -> anyhow::Result<()> {
        let bus = AlertBus::with_capacity(2, 8);
        for piece in 0..5 {
            bus.publish(piece_alert(1, piece));
        }
        assert!(matches!(
            bus.subscribe(AlertFilter::all(), Some(1)),
            Err(Error::AlertOverflow)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn overflow_is_terminal_for_that_subscription_only() -> anyhow::Result<()> {
        let bus = AlertBus::with_capacity(64, 2);
        let mut slow = bus.subscribe(AlertFilter::all(), None)?;
        let mut live = bus.subscribe(AlertFilter::all(), None)?;
        for piece in 0..4 {
            bus.publish(piece_alert(1, piece));
            // Keep the healthy subscriber drained.
            let _ = live.next().await?;
        }
        // The slow subscriber drains its two queued alerts, then hits the
        // terminal overflow error.
        assert!(slow.next().await?.is_some());
        assert!(slow.next().await?.is_some());
        assert!(matches!(slow.next().await, Err(Error::AlertOverflow)));
        // The healthy subscriber keeps receiving.
        bus.publish(piece_alert(1, 9));
        assert!(live.next().await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn close_unblocks_waiting_iterator() -> anyhow::Result<()> {
        let bus = AlertBus::new();
        let mut sub = bus.subscribe(AlertFilter::all(), None)?;
        let closer = sub.closer();
        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;
        closer.close();
        closer.close();
        let result = timeout(Duration::from_secs(1), waiter).await??;
        assert!(matches!(result, Ok(None)));
        Ok(())
    }
}
