#![deny(warnings)]

//! Deferred task registry: keyed one-shot timers with a single retry.
//!
//! A [`Scheduler`] owns every pending settlement of the economy. Each task is
//! identified by a key, fires its callback once after a delay and, when the
//! callback fails, fires it exactly one more time after the retry delay. A
//! task moves through an explicit two-state timer (primary, then retry) rather
//! than re-registering itself, so "one retry" never grows into a chain.
//!
//! Each timer runs on its own tokio task; the registry itself is a sharded
//! concurrent map, so API handlers and firing timers can schedule and cancel
//! without holding any outer lock. [`Scheduler::cancel`] waits for an
//! in-flight firing of the same key to finish, so once it returns no callback
//! of the cancelled task is running or will run.
//!
//! All functions that spawn timers must be called from within a tokio runtime.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info_span, warn, Instrument};

/// Delay before the retry of a failed callback when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Successful outcome of a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settled {
    /// The task is finished and leaves the registry.
    Done,
    /// Re-arm the same key after the given delay with a fresh retry budget.
    Again(Duration),
}

/// Where a registered task currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the primary delay to elapse.
    Waiting,
    /// The primary attempt failed; waiting for the retry delay.
    Retrying,
    /// The callback is running.
    Firing,
}

struct TimerState {
    generation: u64,
    cancelled: AtomicBool,
    wake: Notify,
    firing: AsyncMutex<()>,
    phase: Mutex<Phase>,
}

impl TimerState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            firing: AsyncMutex::new(()),
            phase: Mutex::new(Phase::Waiting),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // A stored permit wakes the timer even if it is not parked yet.
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Sleeps for `delay`; returns false if the task was cancelled meanwhile.
    async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            _ = self.wake.notified() => false,
        }
    }
}

struct Inner<K> {
    tasks: DashMap<K, Arc<TimerState>>,
    retry_delay: Duration,
    generations: AtomicU64,
}

impl<K: Eq + Hash> Inner<K> {
    fn owns(&self, key: &K, generation: u64) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|state| state.generation == generation)
    }
}

/// Registry of pending settlements. Cloning yields another handle to the same
/// registry.
pub struct Scheduler<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash> fmt::Debug for Scheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.inner.tasks.len())
            .field("retry_delay", &self.inner.retry_delay)
            .finish()
    }
}

impl<K> Scheduler<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: DashMap::new(),
                retry_delay,
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.inner.retry_delay
    }

    /// Registers `settle` to run once after `delay`.
    ///
    /// Returns false and registers nothing when `key` already has a task
    /// waiting or retrying. A key whose callback is currently running counts
    /// as free: the new task replaces it and the running callback finishes
    /// without touching the new registration.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, settle: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Settled>> + Send + 'static,
    {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(TimerState::new(generation));
        match self.inner.tasks.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().phase() != Phase::Firing {
                    warn!(%key, "task already scheduled; ignoring");
                    return false;
                }
                slot.insert(Arc::clone(&state));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&state));
            }
        }
        debug!(%key, ?delay, "task scheduled");
        let span = info_span!("settlement", %key);
        tokio::spawn(
            run_timer(Arc::clone(&self.inner), key, state, delay, settle).instrument(span),
        );
        true
    }

    /// Stops the task registered for `key`, including a pending retry.
    ///
    /// If the callback is running, waits for it to finish. Returns false when
    /// nothing was registered.
    pub async fn cancel(&self, key: &K) -> bool {
        let Some((_, state)) = self.inner.tasks.remove(key) else {
            return false;
        };
        state.cancel();
        let _drained = state.firing.lock().await;
        debug!(%key, "task cancelled");
        true
    }

    /// Cancels every registered task; returns how many were stopped.
    pub async fn cancel_all(&self) -> usize {
        let mut stopped = 0;
        for key in self.keys() {
            if self.cancel(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Keys with a task waiting, retrying or firing.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.inner.tasks.contains_key(key)
    }

    pub fn phase(&self, key: &K) -> Option<Phase> {
        self.inner.tasks.get(key).map(|state| state.phase())
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }
}

async fn fire<F, Fut>(state: &TimerState, settle: &F) -> Option<anyhow::Result<Settled>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<Settled>>,
{
    let _firing = state.firing.lock().await;
    if state.is_cancelled() {
        return None;
    }
    state.set_phase(Phase::Firing);
    Some(settle().await)
}

async fn run_timer<K, F, Fut>(
    inner: Arc<Inner<K>>,
    key: K,
    state: Arc<TimerState>,
    mut delay: Duration,
    settle: F,
) where
    K: Eq + Hash + fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<Settled>>,
{
    'cycle: loop {
        if !state.sleep(delay).await {
            return;
        }
        let mut retried = false;
        loop {
            match fire(&state, &settle).await {
                None => return,
                Some(Ok(Settled::Done)) => break 'cycle,
                Some(Ok(Settled::Again(next))) => {
                    if !inner.owns(&key, state.generation) {
                        return;
                    }
                    state.set_phase(Phase::Waiting);
                    delay = next;
                    continue 'cycle;
                }
                Some(Err(err)) if !retried => {
                    warn!(%key, error = %format!("{err:#}"), "settlement failed; retrying once");
                    if !inner.owns(&key, state.generation) {
                        return;
                    }
                    state.set_phase(Phase::Retrying);
                    if !state.sleep(inner.retry_delay).await {
                        return;
                    }
                    retried = true;
                }
                Some(Err(err)) => {
                    // The entity keeps its gate marker; nothing else will clear it.
                    error!(%key, error = %format!("{err:#}"), "settlement failed after retry; giving up");
                    break 'cycle;
                }
            }
        }
    }
    let _ = inner
        .tasks
        .remove_if(&key, |_, current| current.generation == state.generation);
}
