//! Debounced, bounded dispatch of file events.
//!
//! Events pass through three stages:
//!
//! 1. the dispatch buffer, drained in order by a single task;
//! 2. a per-key wait, for CREATE and CHANGED events, which absorbs bursts;
//! 3. processing, capped by a semaphore and serialised per key.
//!
//! A wait lasts `min(min_delay, max_delay - age)`, where `age` is measured
//! from when the first event of the burst arrived. A newer event of the same
//! type replaces the waiting one and keeps its start time, so a file that
//! never stops changing is still dispatched within `max_delay`. An event of a
//! different type releases the waiting one immediately and starts a new wait.
//!
//! DELETE never waits. It cancels the pending wait for its key and is
//! preceded in the buffer by a flush marker: the drain loop stops at the
//! marker until every wait and dispatch issued before it has finished.

use crate::error::{QueueError, QueueResult};
use crate::item::{FileEventItem, FileEventType, QueueEntry};
use crate::snapshot;
use async_trait::async_trait;
use docmesh_storage::KeyValueStore;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Downstream consumer of file events.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, item: &FileEventItem) -> QueueResult<()>;
}

/// Queue timing and concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub min_delay: Duration,
    /// Upper bound between the first event of a burst and its dispatch.
    pub max_delay: Duration,
    /// Events processed at the same time.
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

impl QueueConfig {
    pub fn from_millis(min_delay_ms: u64, max_delay_ms: u64, concurrency: usize) -> Self {
        Self {
            min_delay: Duration::from_millis(min_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            concurrency: concurrency.max(1),
        }
    }

    /// Wait length for a burst that started at `started`, evaluated at `now`.
    #[must_use]
    pub fn delay_at(&self, started: Instant, now: Instant) -> Duration {
        let age = now.saturating_duration_since(started);
        self.min_delay.min(self.max_delay.saturating_sub(age))
    }
}

struct Waiting {
    ticket: u64,
    item: FileEventItem,
    started: Instant,
    deadline: Instant,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    buffered: VecDeque<QueueEntry>,
    waiting: HashMap<String, Waiting>,
    processing: BTreeMap<u64, FileEventItem>,
    next_ticket: u64,
}

impl QueueState {
    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn unresolved_tickets(&self) -> HashSet<u64> {
        self.waiting
            .values()
            .map(|w| w.ticket)
            .chain(self.processing.keys().copied())
            .collect()
    }

    fn has_any(&self, tickets: &HashSet<u64>) -> bool {
        self.processing.keys().any(|t| tickets.contains(t))
            || self.waiting.values().any(|w| tickets.contains(&w.ticket))
    }

    fn is_idle(&self) -> bool {
        self.buffered.is_empty() && self.waiting.is_empty() && self.processing.is_empty()
    }

    fn entries(&self) -> Vec<QueueEntry> {
        let mut owed: Vec<(u64, &FileEventItem)> = self
            .processing
            .iter()
            .map(|(ticket, item)| (*ticket, item))
            .chain(self.waiting.values().map(|w| (w.ticket, &w.item)))
            .collect();
        owed.sort_by_key(|(ticket, _)| *ticket);

        owed.into_iter()
            .map(|(_, item)| QueueEntry::Event(item.clone()))
            .chain(self.buffered.iter().cloned())
            .collect()
    }
}

enum Step {
    Idle,
    Handled,
    Flush(HashSet<u64>),
}

struct Inner {
    config: QueueConfig,
    processor: Arc<dyn FileProcessor>,
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<QueueState>,
    wake: Notify,
    progress: watch::Sender<u64>,
    semaphore: Arc<Semaphore>,
    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &QueueState) -> QueueResult<()> {
        snapshot::save(self.kv.as_ref(), &state.entries())
    }

    fn persist_or_warn(&self, state: &QueueState) {
        if let Err(e) = self.persist(state) {
            warn!("Failed to snapshot file event queue: {e}");
        }
    }

    fn changed(&self) {
        self.progress.send_modify(|v| *v = v.wrapping_add(1));
    }

    async fn drain(self: Arc<Self>) {
        loop {
            match self.next_step() {
                Step::Idle => self.wake.notified().await,
                Step::Handled => {}
                Step::Flush(tickets) => self.flush(tickets).await,
            }
        }
    }

    fn next_step(self: &Arc<Self>) -> Step {
        let mut state = self.lock();
        let at_flush = match state.buffered.front() {
            None => return Step::Idle,
            Some(entry) => matches!(entry, QueueEntry::Flush),
        };
        if at_flush {
            return Step::Flush(state.unresolved_tickets());
        }

        if let Some(QueueEntry::Event(item)) = state.buffered.pop_front() {
            if let Err(e) = self.accept(&mut state, item) {
                error!("{e}");
            }
        }
        self.persist_or_warn(&state);
        drop(state);
        self.changed();
        Step::Handled
    }

    async fn flush(&self, tickets: HashSet<u64>) {
        if !tickets.is_empty() {
            debug!(pending = tickets.len(), "Flush waiting for earlier file events");
            let mut rx = self.progress.subscribe();
            loop {
                let pending = self.lock().has_any(&tickets);
                if !pending || self.closed.load(Ordering::SeqCst) {
                    break;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }

        let mut state = self.lock();
        if matches!(state.buffered.front(), Some(QueueEntry::Flush)) {
            state.buffered.pop_front();
        }
        self.persist_or_warn(&state);
        drop(state);
        self.changed();
    }

    fn accept(self: &Arc<Self>, state: &mut QueueState, item: FileEventItem) -> QueueResult<()> {
        if item.bypasses_wait() {
            let ticket = state.issue_ticket();
            self.dispatch(state, ticket, item);
            return Ok(());
        }

        let now = Instant::now();
        match state.waiting.remove(&item.key) {
            Some(previous) if previous.item.event_type == item.event_type => {
                previous.timer.abort();
                debug!(file = %item.file, "Superseding pending {:?} wait", item.event_type);
                self.begin_wait(state, previous.ticket, item, previous.started, now)
            }
            Some(previous) => {
                previous.timer.abort();
                debug!(
                    file = %item.file,
                    "Releasing pending {:?} wait for {:?}",
                    previous.item.event_type,
                    item.event_type
                );
                self.dispatch(state, previous.ticket, previous.item);
                let ticket = state.issue_ticket();
                self.begin_wait(state, ticket, item, now, now)
            }
            None => {
                let ticket = state.issue_ticket();
                self.begin_wait(state, ticket, item, now, now)
            }
        }
    }

    fn begin_wait(
        self: &Arc<Self>,
        state: &mut QueueState,
        ticket: u64,
        item: FileEventItem,
        started: Instant,
        now: Instant,
    ) -> QueueResult<()> {
        if state.waiting.contains_key(&item.key) {
            return Err(QueueError::Invariant(format!(
                "already waiting for key {}",
                item.key
            )));
        }

        let deadline = now + self.config.delay_at(started, now);
        let inner = Arc::clone(self);
        let key = item.key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.proceed(&key, ticket);
        });

        state.waiting.insert(
            item.key.clone(),
            Waiting {
                ticket,
                item,
                started,
                deadline,
                timer,
            },
        );
        Ok(())
    }

    fn proceed(self: &Arc<Self>, key: &str, ticket: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        let due = state
            .waiting
            .get(key)
            .is_some_and(|w| w.ticket == ticket && w.deadline <= Instant::now());
        if !due {
            return;
        }
        if let Some(waiting) = state.waiting.remove(key) {
            self.dispatch(&mut state, waiting.ticket, waiting.item);
        }
        self.persist_or_warn(&state);
        drop(state);
        self.changed();
    }

    /// Releases every waiting event. Returns whether any was waiting.
    fn force_all(self: &Arc<Self>, state: &mut QueueState) -> bool {
        let forced: Vec<Waiting> = state.waiting.drain().map(|(_, w)| w).collect();
        for waiting in &forced {
            waiting.timer.abort();
        }
        let any = !forced.is_empty();
        for waiting in forced {
            self.dispatch(state, waiting.ticket, waiting.item);
        }
        any
    }

    fn dispatch(self: &Arc<Self>, state: &mut QueueState, ticket: u64, item: FileEventItem) {
        state.processing.insert(ticket, item.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.process(ticket, item).await });
    }

    async fn process(self: Arc<Self>, ticket: u64, item: FileEventItem) {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            debug!(file = %item.file, "Queue closed before dispatch");
            return;
        };

        let lock = self.path_lock(&item.key);
        {
            let _guard = lock.lock().await;
            debug!(file = %item.file, kind = ?item.event_type, "Processing file event");
            if let Err(e) = self.processor.process(&item).await {
                warn!(file = %item.file, "File event failed: {e}");
            }
        }
        drop(lock);
        self.release_path_lock(&item.key);

        let mut state = self.lock();
        state.processing.remove(&ticket);
        self.persist_or_warn(&state);
        drop(state);
        self.changed();
    }

    fn path_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn release_path_lock(&self, key: &str) {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

/// Debounced file-event queue with a persisted snapshot.
///
/// Must be created inside a tokio runtime. Dropping the queue shuts it down;
/// whatever it still owed the processor stays in the snapshot for
/// [`FileEventQueue::restore`] on the next start.
pub struct FileEventQueue {
    inner: Arc<Inner>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileEventQueue {
    pub fn new(
        config: QueueConfig,
        processor: Arc<dyn FileProcessor>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (progress, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            processor,
            kv,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            progress,
            path_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let drain_task = tokio::spawn(Arc::clone(&inner).drain());

        Self {
            inner,
            drain_task: Mutex::new(Some(drain_task)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Adds an event to the dispatch buffer and snapshots the queue.
    pub fn enqueue(&self, item: FileEventItem) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::ShutDown);
        }

        let mut state = self.inner.lock();
        if item.event_type == FileEventType::Delete {
            if let Some(waiting) = state.waiting.remove(&item.key) {
                waiting.timer.abort();
                debug!(file = %waiting.item.file, "Pending wait cancelled by delete");
            }
            state.buffered.push_back(QueueEntry::Flush);
        }
        state.buffered.push_back(QueueEntry::Event(item));
        let result = self.inner.persist(&state);
        drop(state);

        self.inner.wake.notify_one();
        self.inner.changed();
        result
    }

    /// Replays the persisted snapshot. Restored events skip the debounce wait.
    ///
    /// Returns the number of events restored.
    pub fn restore(&self) -> QueueResult<usize> {
        if self.is_closed() {
            return Err(QueueError::ShutDown);
        }
        let entries = snapshot::load(self.inner.kv.as_ref())?;

        let mut state = self.inner.lock();
        if !state.is_idle() {
            return Err(QueueError::Invariant(
                "restore on a queue that already holds events".to_string(),
            ));
        }
        let mut restored = 0;
        for entry in entries {
            match entry {
                QueueEntry::Event(mut item) => {
                    if item.key.is_empty() {
                        item.key = item.file.clone();
                    }
                    state
                        .buffered
                        .push_back(QueueEntry::Event(item.skipping_batch_wait()));
                    restored += 1;
                }
                QueueEntry::Flush => state.buffered.push_back(QueueEntry::Flush),
            }
        }
        self.inner.persist(&state)?;
        drop(state);

        if restored > 0 {
            info!(restored, "Restored file events from snapshot");
        }
        self.inner.wake.notify_one();
        self.inner.changed();
        Ok(restored)
    }

    /// Forces every waiting event and resolves once nothing is buffered,
    /// waiting or processing.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.progress.subscribe();
        loop {
            let forced = {
                let mut state = self.inner.lock();
                let forced = self.inner.force_all(&mut state);
                if forced {
                    self.inner.persist_or_warn(&state);
                }
                if state.is_idle() || self.is_closed() {
                    return;
                }
                forced
            };
            if forced {
                self.inner.changed();
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops draining and timers. Work in progress finishes; everything
    /// else stays in the snapshot.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        {
            let state = self.inner.lock();
            for waiting in state.waiting.values() {
                waiting.timer.abort();
            }
        }
        self.inner.semaphore.close();
        self.inner.changed();
        info!("File event queue shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether an event for `key` is waiting out its delay.
    pub fn is_waiting(&self, key: &str) -> bool {
        self.inner.lock().waiting.contains_key(key)
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Current composite state, in snapshot order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries()
    }
}

impl Drop for FileEventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
