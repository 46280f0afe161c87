use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::sync::{watch, Notify};
use tracing::{event, Level};

/// Per-item exponential backoff used by [`WorkQueue::add_rate_limited`].
///
/// The delay doubles with every recorded failure, starting at `base` and
/// capped at `max`, and is then randomized into the upper half of that
/// value to avoid thundering herds.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Returns the delay to wait before the next attempt of an item that
    /// has already failed `failures` times.
    pub fn backoff(&self, failures: u32) -> Duration {
        let delay = 2u32
            .checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max);
        delay.mul_f64(thread_rng().gen_range(0.5..=1.0))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

/// A cloneable handle that resolves once the owning [`WorkQueue`] has been
/// shut down. Long waits inside a reconciliation select on this so that
/// they are abandoned when the process stops.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until shutdown has been requested. Also returns if the queue
    /// itself has been dropped.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    available: Notify,
    shutdown_tx: watch::Sender<bool>,
    rate_limiter: RateLimiter,
}

/// A deduplicating, rate-limited queue of work items.
///
/// An item is held at most once: adding an item that is already queued is a
/// no-op, and adding an item that is currently being processed only marks
/// it dirty so that it is queued again once [`done`](Self::done) is called.
/// This guarantees that two workers never process the same item at the same
/// time, no matter how many notifications arrive for it.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, rate_limiter: RateLimiter) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                shutdown_tx,
                rate_limiter,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Blocks until an item is available and hands it out, or returns
    /// `None` once the queue has been shut down. Every item returned must
    /// eventually be passed to [`done`](Self::done).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as no longer being processed. If it was added again in
    /// the meantime it goes back into the queue.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.available.notify_one();
        }
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// The number of times `item` has been requeued through
    /// [`add_rate_limited`](Self::add_rate_limited) since it was last
    /// forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or_default()
    }

    /// Records a failure for `item` and adds it back once its backoff has
    /// elapsed.
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.state();
            let failures = state.failures.entry(item.clone()).or_default();
            let previous = *failures;
            *failures = failures.saturating_add(1);
            previous
        };
        let delay = self.shared.rate_limiter.backoff(failures);
        event!(
            Level::DEBUG,
            queue = %self.shared.name,
            item = ?item,
            delay_ms = delay.as_millis(),
            "Requeueing with backoff."
        );
        self.add_after(item, delay);
    }

    /// Adds `item` after `delay`. Pending delayed adds are abandoned when
    /// the queue shuts down.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = shutdown.triggered() => {}
            }
        });
    }

    /// Discards all pending items and makes every current and future call
    /// to [`get`](Self::get) return `None`. Items already handed out may
    /// still be finished with [`done`](Self::done).
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.shared.shutdown_tx.send_replace(true);
        self.shared.available.notify_waiters();
        event!(Level::INFO, queue = %self.shared.name, "Work queue shut down.");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown {
            rx: self.shared.shutdown_tx.subscribe(),
        }
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
