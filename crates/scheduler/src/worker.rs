//! Fetcher worker pool for background cell loading.
//!
//! Fetchers are daemon threads that withdraw keys from a [`FetchQueue`] and
//! hand them to a fetch executor callback. A failing or panicking executor
//! never takes its fetcher down; the error is logged and the loop continues
//! with the next key. The pool can be paused for a bounded time, or held
//! off while foreground threads run synchronous loads, so that they do not
//! contend with it.

use crate::cancel::CancellationToken;
use crate::error::SchedulerError;
use crate::fetch_queue::FetchQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Error type returned by fetch executors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked by a fetcher for every key it takes from the queue.
pub type FetchExecutor<K> = Arc<dyn Fn(&K) -> Result<(), BoxError> + Send + Sync>;

/// Poll interval of a [`FetcherConfig`] unless set otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the fetcher pool.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Number of fetcher threads to spawn.
    pub num_fetchers: usize,

    /// Maximum time a fetcher waits for a key before re-checking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl FetcherConfig {
    /// Create a new fetcher pool configuration.
    pub fn new(num_fetchers: usize) -> Self {
        Self {
            num_fetchers,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the poll interval for fetchers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Fetcher pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetcherStats {
    /// Keys the executor completed successfully
    pub completed: u64,

    /// Keys whose executor returned an error or panicked
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
struct PauseState {
    until: Option<Instant>,
    holds: usize,
}

impl PauseState {
    fn is_paused(&self, now: Instant) -> bool {
        self.holds > 0 || self.until.is_some_and(|deadline| deadline > now)
    }
}

/// Pause window and hold count observed by every fetcher between take and
/// execute
#[derive(Default)]
struct PauseGate {
    state: Mutex<PauseState>,
    changed: Condvar,
}

impl PauseGate {
    fn pause_until(&self, deadline: Instant) {
        let mut state = self.state.lock();
        if state.until.map_or(true, |current| deadline > current) {
            state.until = Some(deadline);
        }
    }

    /// Ends the time window only; holds stay in effect
    fn wake(&self) {
        self.state.lock().until = None;
        self.changed.notify_all();
    }

    fn acquire(&self) {
        self.state.lock().holds += 1;
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.holds = state.holds.saturating_sub(1);
        if state.holds == 0 {
            self.changed.notify_all();
        }
    }

    fn holds(&self) -> usize {
        self.state.lock().holds
    }

    fn is_paused(&self) -> bool {
        self.state.lock().is_paused(Instant::now())
    }

    fn wait(&self, token: &CancellationToken) {
        let mut state = self.state.lock();
        loop {
            if token.is_cancelled() || !state.is_paused(Instant::now()) {
                break;
            }
            if state.holds > 0 {
                self.changed.wait(&mut state);
            } else if let Some(deadline) = state.until {
                self.changed.wait_until(&mut state, deadline);
            }
        }
    }
}

/// Keeps the fetchers from starting new work until dropped
///
/// Returned by [`FetcherPool::hold`]. Holds from several threads stack: the
/// fetchers resume once the last one is dropped and no pause window is
/// left.
#[must_use = "fetchers resume as soon as the hold is dropped"]
pub struct FetcherHold {
    gate: Arc<PauseGate>,
}

impl Debug for FetcherHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherHold").finish_non_exhaustive()
    }
}

impl Drop for FetcherHold {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Background fetcher pool.
///
/// # Example
///
/// ```
/// use cellstream_scheduler::{BoxError, FetchQueue, FetcherConfig, FetcherPool};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let queue = Arc::new(FetchQueue::new(1));
/// let loaded = Arc::new(AtomicUsize::new(0));
/// let counter = loaded.clone();
///
/// let pool = FetcherPool::new(
///     queue.clone(),
///     Arc::new(move |_key: &u32| -> Result<(), BoxError> {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }),
///     FetcherConfig::new(2),
/// )
/// .unwrap();
///
/// queue.put(1, 0, false).unwrap();
/// pool.shutdown();
/// ```
pub struct FetcherPool<K> {
    queue: Arc<FetchQueue<K>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_fetchers: usize,
    token: CancellationToken,
    pause: Arc<PauseGate>,
    counters: Arc<Counters>,
}

impl<K> FetcherPool<K>
where
    K: Debug + Send + 'static,
{
    /// Spawn `config.num_fetchers` fetcher threads.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a thread cannot be spawned; fetchers spawned
    /// before the failure are shut down again.
    pub fn new(
        queue: Arc<FetchQueue<K>>,
        executor: FetchExecutor<K>,
        config: FetcherConfig,
    ) -> std::io::Result<Self> {
        let pool = Self {
            queue,
            workers: Mutex::new(Vec::with_capacity(config.num_fetchers)),
            num_fetchers: config.num_fetchers,
            token: CancellationToken::new(),
            pause: Arc::new(PauseGate::default()),
            counters: Arc::new(Counters::default()),
        };

        for id in 0..config.num_fetchers {
            let fetcher = Fetcher {
                id,
                queue: pool.queue.clone(),
                executor: executor.clone(),
                token: pool.token.clone(),
                pause: pool.pause.clone(),
                counters: pool.counters.clone(),
                poll_interval: config.poll_interval,
            };
            let handle = thread::Builder::new()
                .name(format!("cellstream-fetcher-{}", id))
                .spawn(move || fetcher.run())?;
            pool.workers.lock().push(handle);
        }

        debug!(fetchers = config.num_fetchers, "Fetcher pool started");
        Ok(pool)
    }
}

impl<K> FetcherPool<K> {
    /// Number of fetcher threads.
    pub fn num_fetchers(&self) -> usize {
        self.num_fetchers
    }

    /// Pause all fetchers for `duration` from now.
    ///
    /// A fetcher that already took a key holds it until the pause ends.
    /// Never shortens a longer pause that is already in effect.
    pub fn pause_for(&self, duration: Duration) {
        self.pause_until(Instant::now() + duration);
    }

    /// Pause all fetchers until `deadline`.
    pub fn pause_until(&self, deadline: Instant) {
        self.pause.pause_until(deadline);
    }

    /// End the pause window immediately.
    ///
    /// Outstanding [`FetcherHold`]s keep the fetchers waiting.
    pub fn wake_now(&self) {
        self.pause.wake();
    }

    /// Hold the fetchers off until the returned guard is dropped.
    ///
    /// Unlike [`FetcherPool::wake_now`], releasing a hold never ends a
    /// pause window or another thread's hold.
    pub fn hold(&self) -> FetcherHold {
        self.pause.acquire();
        FetcherHold {
            gate: Arc::clone(&self.pause),
        }
    }

    /// Number of outstanding holds.
    pub fn active_holds(&self) -> usize {
        self.pause.holds()
    }

    /// Check if a pause window or a hold is currently in effect.
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Check if the pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Snapshot of executor outcomes.
    pub fn stats(&self) -> FetcherStats {
        FetcherStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop all fetchers and wait for them to exit.
    ///
    /// Interrupts fetchers blocked on the queue or in a pause. A fetcher in
    /// the middle of executing finishes that key first. Calling this more
    /// than once is a no-op.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.queue.interrupt();
        self.pause.wake();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if let Err(e) = handle.join() {
                warn!("Fetcher thread panicked: {:?}", e);
            }
        }
        debug!("Fetcher pool stopped");
    }
}

impl<K> Drop for FetcherPool<K> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by a single fetcher thread.
struct Fetcher<K> {
    id: usize,
    queue: Arc<FetchQueue<K>>,
    executor: FetchExecutor<K>,
    token: CancellationToken,
    pause: Arc<PauseGate>,
    counters: Arc<Counters>,
    poll_interval: Duration,
}

impl<K: Debug> Fetcher<K> {
    fn run(self) {
        loop {
            let key = match self.queue.take_timeout(self.poll_interval, &self.token) {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(SchedulerError::Cancelled) => break,
                Err(e) => {
                    warn!(fetcher = self.id, "Fetch queue error: {}", e);
                    continue;
                }
            };

            self.pause.wait(&self.token);
            if self.token.is_cancelled() {
                break;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| (self.executor)(&key))) {
                Ok(Ok(())) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(fetcher = self.id, key = ?key, "Background fetch failed: {}", e);
                }
                Err(_) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(fetcher = self.id, key = ?key, "Background fetch panicked");
                }
            }
        }
    }
}
