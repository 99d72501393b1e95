//! Volatile cell cache controller
//!
//! Ties the entry store, the priority fetch queue, the fetcher pool and the
//! task groups' IO time budgets together. For every request it returns the
//! cell's entry and, depending on the loading strategy, leaves an invalid
//! cell alone, enqueues it for the fetchers, or loads it on the calling
//! thread.
//!
//! The renderer calls [`VolatileCellCache::prepare_next_frame`] once before
//! each pass. Requests not serviced during the previous pass then degrade
//! into prefetch, and every cell becomes eligible for enqueueing again.

use crate::error::{CacheError, Result};
use crate::grid::CellGeometry;
use crate::loader::CellLoader;
use crate::strategy::{CacheHints, LoadingStrategy};
use crate::view::CellView;
use cellstream_cache::{
    CacheConfig, CellAddress, CellData, CellEntryStore, CellHandle, Element, MemoryBudgetConfig,
    PlaceholderPool, StoreStats,
};
use cellstream_scheduler::{
    BoxError, FetchExecutor, FetchQueue, FetcherConfig, FetcherPool, FetcherStats, QueueStats,
    SchedulerError, TaskGroup,
};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Request counts per loading strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub volatile: u64,
    pub blocking: u64,
    pub budgeted: u64,
    pub dont_load: u64,
}

impl RequestCounts {
    /// Requests over all strategies
    pub fn total(&self) -> u64 {
        self.volatile + self.blocking + self.budgeted + self.dont_load
    }
}

/// Statistics of the cell cache
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerStats {
    /// Current frame
    pub frame: i64,

    /// Requests per strategy
    pub requests: RequestCounts,

    /// Cells loaded on a requesting thread
    pub inline_loads: u64,

    /// Cells put in the fetch queue
    pub enqueued: u64,

    /// Cells loaded by the fetchers
    pub background_loads: u64,

    /// Budgeted requests that found their budget exhausted
    pub budget_exhausted: u64,

    /// Failed loads, inline or background
    pub failures: u64,

    /// Keys waiting in the fetch queue
    pub queue_len: usize,

    /// Fetch queue counters
    pub queue: QueueStats,

    /// Fetcher pool counters
    pub fetchers: FetcherStats,

    /// Entry store counters
    pub store: StoreStats,
}

#[derive(Debug, Default)]
struct Counters {
    requests: [AtomicU64; 4],
    inline_loads: AtomicU64,
    enqueued: AtomicU64,
    background_loads: AtomicU64,
    budget_exhausted: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn requests(&self) -> RequestCounts {
        let count = |strategy: LoadingStrategy| self.requests[strategy.index()].load(Ordering::Relaxed);
        RequestCounts {
            volatile: count(LoadingStrategy::Volatile),
            blocking: count(LoadingStrategy::Blocking),
            budgeted: count(LoadingStrategy::Budgeted),
            dont_load: count(LoadingStrategy::DontLoad),
        }
    }
}

/// State shared with the fetcher threads
struct Shared<T> {
    store: CellEntryStore<T>,
    loader: Arc<dyn CellLoader<T>>,
    counters: Counters,
}

impl<T: Element> Shared<T> {
    /// Load `entry` through the backend unless it is valid
    fn load(&self, entry: &CellHandle<T>) -> Result<bool> {
        let placeholder = entry.data();
        let result = self.store.load_if_invalid(entry, |address| {
            let elements = self
                .loader
                .load(
                    address.timepoint,
                    address.setup,
                    address.level,
                    placeholder.dims(),
                    placeholder.min(),
                )
                .map_err(|source| CacheError::Load {
                    address: *address,
                    source,
                })?;
            CellData::loaded(elements, placeholder.dims().to_vec(), placeholder.min().to_vec())
                .map_err(|err| CacheError::Load {
                    address: *address,
                    source: Box::new(err),
                })
        });
        if result.is_err() {
            Counters::bump(&self.counters.failures);
        }
        result
    }

    /// Fetcher side: load the cell if anyone still holds it
    fn fetch(&self, address: &CellAddress) -> std::result::Result<(), BoxError> {
        let Some(entry) = self.store.lookup(address) else {
            return Ok(());
        };
        if self.load(&entry)? {
            Counters::bump(&self.counters.background_loads);
        }
        Ok(())
    }
}

/// Asynchronous, priority-aware, budget-constrained cell cache
///
/// # Example
///
/// ```
/// use cellstream_cache::CacheConfig;
/// use cellstream_core::{CacheHints, CellLoader, LoadingStrategy, UniformGeometry, VolatileCellCache};
/// use cellstream_scheduler::{BoxError, TaskGroup};
/// use std::sync::Arc;
///
/// struct Zeros;
///
/// impl CellLoader<u8> for Zeros {
///     fn load(&self, _t: u32, _s: u32, _l: u32, dims: &[usize], _min: &[i64]) -> Result<Vec<u8>, BoxError> {
///         Ok(vec![0; dims.iter().product()])
///     }
/// }
///
/// let geometry = UniformGeometry::new(1, vec![256, 256], vec![64, 64], 3).unwrap();
/// let config = CacheConfig::default().with_fetcher_threads(1);
/// let cache = VolatileCellCache::<u8>::new(Arc::new(Zeros), Arc::new(geometry), &config).unwrap();
///
/// let group = TaskGroup::new("render");
/// cache.prepare_next_frame();
///
/// let hints = CacheHints::new(LoadingStrategy::Blocking, 0, false);
/// let cell = cache.request(cellstream_cache::CellAddress::new(0, 0, 0, 5), &hints, &group).unwrap();
/// assert!(cell.is_valid());
/// assert_eq!(cell.data().dims(), &[64, 64]);
/// ```
pub struct VolatileCellCache<T: Element> {
    shared: Arc<Shared<T>>,
    geometry: Arc<dyn CellGeometry>,
    placeholders: PlaceholderPool,
    queue: Arc<FetchQueue<CellAddress>>,
    fetchers: FetcherPool<CellAddress>,
    frame: AtomicI64,
    budgeted_pause: Duration,
    shut_down: AtomicBool,
}

impl<T: Element> VolatileCellCache<T> {
    /// Create a cache and start its fetcher threads
    ///
    /// The queue gets one priority lane per resolution level of the deepest
    /// setup in `geometry`.
    pub fn new(
        loader: Arc<dyn CellLoader<T>>,
        geometry: Arc<dyn CellGeometry>,
        config: &CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        let num_priorities = geometry.max_levels().max(1);

        let retention = MemoryBudgetConfig::with_limit_bytes(config.soft_retention_bytes());
        let shared = Arc::new(Shared {
            store: CellEntryStore::new(retention).with_reap_batch(config.reap_batch),
            loader,
            counters: Counters::default(),
        });

        let queue = Arc::new(FetchQueue::with_prefetch_capacity(
            num_priorities,
            config.prefetch_capacity,
        ));

        let executor: FetchExecutor<CellAddress> = {
            let shared = Arc::clone(&shared);
            Arc::new(move |address: &CellAddress| shared.fetch(address))
        };
        let fetcher_config = FetcherConfig::new(config.num_fetcher_threads)
            .with_poll_interval(config.fetcher_poll_interval());
        let fetchers = FetcherPool::new(Arc::clone(&queue), executor, fetcher_config)
            .map_err(CacheError::Spawn)?;

        debug!(
            num_priorities,
            fetchers = config.num_fetcher_threads,
            element = T::NAME,
            "Cell cache started"
        );

        Ok(Self {
            shared,
            geometry,
            placeholders: PlaceholderPool::new(),
            queue,
            fetchers,
            frame: AtomicI64::new(0),
            budgeted_pause: config.budgeted_pause(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Request the cell at `address`
    ///
    /// Always returns the cell's entry, whose data may still be an invalid
    /// placeholder under `Volatile`, `Budgeted` and `DontLoad`. Blocking and
    /// budgeted loads that fail return the backend error and leave the cell
    /// invalid.
    pub fn request(
        &self,
        address: CellAddress,
        hints: &CacheHints,
        group: &TaskGroup,
    ) -> Result<CellHandle<T>> {
        self.check_priority(hints.priority)?;
        Counters::bump(&self.shared.counters.requests[hints.strategy.index()]);

        let entry = self
            .shared
            .store
            .get_or_try_create(address, || self.placeholder(&address))?;
        if entry.is_valid() {
            return Ok(entry);
        }

        trace!(%address, strategy = %hints.strategy, priority = hints.priority, "cell miss");
        match hints.strategy {
            LoadingStrategy::DontLoad => {}
            LoadingStrategy::Volatile => self.enqueue(&entry, hints)?,
            LoadingStrategy::Blocking => {
                self.ensure_running()?;
                self.load_inline(&entry)?;
            }
            LoadingStrategy::Budgeted => self.load_budgeted(&entry, hints, group)?,
        }
        Ok(entry)
    }

    /// Live entry for `address`, without creating, loading or enqueueing
    pub fn get_if_present(&self, address: &CellAddress) -> Option<CellHandle<T>> {
        self.shared.store.lookup(address)
    }

    /// Start a new frame
    ///
    /// Pending requests move to the prefetch lane and the frame counter
    /// advances, so cells enqueued last frame may be enqueued again.
    /// Also trims the soft tier under memory pressure and reaps dead slots.
    pub fn prepare_next_frame(&self) -> i64 {
        let demoted = self.queue.clear();
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let trimmed = self.shared.store.trim();
        let reaped = self.shared.store.reap_reclaimed();
        debug!(frame, demoted, trimmed, reaped, "Prepared next frame");
        frame
    }

    /// Current frame number
    pub fn current_frame(&self) -> i64 {
        self.frame.load(Ordering::Acquire)
    }

    /// (Re)initialize `group`'s IO time budget, in nanoseconds per level
    ///
    /// Levels beyond `partial` take its last value. The budget is replaced
    /// if `reinitialize` is set or the group has none.
    pub fn init_io_time_budget(
        &self,
        group: &TaskGroup,
        partial: &[i64],
        reinitialize: bool,
    ) -> Result<()> {
        group.init_budget(self.queue.num_priorities(), partial, reinitialize)?;
        Ok(())
    }

    /// View of one (timepoint, setup, level) with default hints
    ///
    /// Default hints are `Volatile` with a priority that favors coarser
    /// levels.
    pub fn view(&self, timepoint: u32, setup: u32, level: u32) -> CellView<'_, T> {
        CellView::new(self, timepoint, setup, level)
    }

    /// Number of queue priorities, also the number of budget levels
    pub fn num_priorities(&self) -> usize {
        self.queue.num_priorities()
    }

    /// Geometry of the cached dataset
    pub fn geometry(&self) -> &dyn CellGeometry {
        self.geometry.as_ref()
    }

    /// Pause the fetcher threads for `duration`
    pub fn pause_fetchers_for(&self, duration: Duration) {
        self.fetchers.pause_for(duration);
    }

    /// End the fetcher pause window
    ///
    /// Budgeted loads still in flight keep the fetchers held.
    pub fn wake_fetchers(&self) {
        self.fetchers.wake_now();
    }

    /// Whether the fetchers are paused or held by budgeted loads
    pub fn fetchers_paused(&self) -> bool {
        self.fetchers.is_paused()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ControllerStats {
        let counters = &self.shared.counters;
        ControllerStats {
            frame: self.current_frame(),
            requests: counters.requests(),
            inline_loads: counters.inline_loads.load(Ordering::Relaxed),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            background_loads: counters.background_loads.load(Ordering::Relaxed),
            budget_exhausted: counters.budget_exhausted.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            queue: self.queue.stats(),
            fetchers: self.fetchers.stats(),
            store: self.shared.store.stats(),
        }
    }

    /// Whether [`VolatileCellCache::shutdown`] ran
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the fetchers and drop every entry the cache holds itself
    ///
    /// Afterwards, requests that would load or enqueue fail with
    /// [`CacheError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fetchers.shutdown();
        let released = self.shared.store.evict_all();
        debug!(released, "Cell cache shut down");
    }

    fn check_priority(&self, priority: usize) -> Result<()> {
        let levels = self.queue.num_priorities();
        if priority >= levels {
            return Err(SchedulerError::PriorityOutOfRange { priority, levels }.into());
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(CacheError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn placeholder(&self, address: &CellAddress) -> Result<CellData<T>> {
        let block = self
            .geometry
            .grid(address.setup, address.level)
            .and_then(|grid| grid.cell(address.index))
            .ok_or(CacheError::InvalidAddress { address: *address })?;
        Ok(CellData::placeholder(&self.placeholders, block.dims, block.min))
    }

    fn enqueue(&self, entry: &CellHandle<T>, hints: &CacheHints) -> Result<()> {
        self.ensure_running()?;
        let frame = self.current_frame();
        if entry.try_mark_enqueued(frame) {
            self.queue
                .put(*entry.key(), hints.priority, hints.enqueue_to_front)?;
            Counters::bump(&self.shared.counters.enqueued);
            trace!(address = %entry.key(), frame, "enqueued cell");
        }
        Ok(())
    }

    fn load_inline(&self, entry: &CellHandle<T>) -> Result<bool> {
        let loaded = self.shared.load(entry)?;
        if loaded {
            Counters::bump(&self.shared.counters.inline_loads);
        }
        Ok(loaded)
    }

    fn load_budgeted(&self, entry: &CellHandle<T>, hints: &CacheHints, group: &TaskGroup) -> Result<()> {
        self.ensure_running()?;
        let levels = self.queue.num_priorities();
        if group.time_left(hints.priority, levels)? <= 0 {
            Counters::bump(&self.shared.counters.budget_exhausted);
            return self.enqueue(entry, hints);
        }

        let hold = self.fetchers.hold();
        group.start_io();
        let started = Instant::now();
        let result = self.load_inline(entry);
        let elapsed = started.elapsed();
        let bytes = match result {
            Ok(true) => {
                (entry.data().num_elements() as f64 * self.shared.loader.bytes_per_element()) as u64
            }
            _ => 0,
        };
        group.stop_io(bytes);
        drop(hold);
        // The next budgeted load of this pass should find the fetchers idle
        self.fetchers.pause_for(self.budgeted_pause);

        group.use_time(elapsed, hints.priority, levels)?;
        result.map(|_| ())
    }
}

impl<T: Element> Drop for VolatileCellCache<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
