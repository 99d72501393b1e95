//! IO accounting per task group
//!
//! A task group is one logical set of foreground threads, typically the
//! threads of one render pass. Each group owns an [`IoTimeBudget`] and running
//! IO statistics. Callers pass their group explicitly to the cache; nothing
//! here is looked up from thread-local state.

use crate::error::Result;
use crate::io_budget::IoTimeBudget;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Cumulative IO statistics of one task group
#[derive(Debug, Default)]
pub struct IoStatistics {
    /// Lazily created on first budget query
    budget: Option<IoTimeBudget>,

    /// Completed blocking IO time
    io_nanos: u64,

    /// Bytes loaded by blocking IO
    io_bytes: u64,

    /// Number of loads performed inline by this group
    inline_loads: u64,

    /// Nesting depth of `start`/`stop`
    running: u32,

    /// When the outermost running `start` happened
    started_at: Option<Instant>,
}

impl IoStatistics {
    /// Start the IO stopwatch. Nested calls only count the outermost span.
    pub fn start(&mut self) {
        if self.running == 0 {
            self.started_at = Some(Instant::now());
        }
        self.running += 1;
    }

    /// Stop the IO stopwatch
    pub fn stop(&mut self) {
        if self.running == 0 {
            return;
        }
        self.running -= 1;
        if self.running == 0 {
            if let Some(started) = self.started_at.take() {
                self.io_nanos += started.elapsed().as_nanos() as u64;
            }
        }
    }

    /// Total IO time in nanoseconds, including a span still running
    pub fn io_nanos(&self) -> u64 {
        let running = self
            .started_at
            .map(|started| started.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        self.io_nanos + running
    }

    /// Record bytes delivered by a completed load
    pub fn add_bytes(&mut self, bytes: u64) {
        self.io_bytes += bytes;
    }

    /// Total bytes loaded
    pub fn io_bytes(&self) -> u64 {
        self.io_bytes
    }

    /// Number of inline loads
    pub fn inline_loads(&self) -> u64 {
        self.inline_loads
    }

    /// The group's budget, if one was created
    pub fn budget(&self) -> Option<&IoTimeBudget> {
        self.budget.as_ref()
    }

    fn budget_or_init(&mut self, num_levels: usize) -> Result<&mut IoTimeBudget> {
        let budget = match self.budget.take() {
            Some(budget) => budget,
            None => IoTimeBudget::exhausted(num_levels)?,
        };
        Ok(self.budget.insert(budget))
    }
}

/// Point-in-time copy of a group's statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoSnapshot {
    /// Total blocking IO time
    pub io_time: Duration,

    /// Total bytes loaded inline
    pub io_bytes: u64,

    /// Number of inline loads
    pub inline_loads: u64,

    /// Current per-level budget, empty if none was created yet
    pub budget: Vec<i64>,
}

impl IoSnapshot {
    /// Throughput of inline loads in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.io_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.io_bytes as f64 / secs
        }
    }
}

/// Handle identifying one group of foreground threads
///
/// Shared between the threads of the group (wrap it in an `Arc`). Budget
/// and statistics mutation is synchronized per group.
///
/// # Example
///
/// ```
/// use cellstream_scheduler::TaskGroup;
///
/// let group = TaskGroup::new("render");
/// group.init_budget(3, &[1_000_000, 500_000], true).unwrap();
/// assert_eq!(group.time_left(2, 3).unwrap(), 500_000);
/// ```
#[derive(Debug)]
pub struct TaskGroup {
    id: u64,
    name: String,
    stats: Mutex<IoStatistics>,
}

impl TaskGroup {
    /// Create a new task group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            stats: Mutex::new(IoStatistics::default()),
        }
    }

    /// Unique identifier of this group
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// (Re)initialize the group's budget for a new render pass
    ///
    /// Creates a fresh budget with `num_levels` levels if there is none or
    /// `reinitialize` is set, then resets it from `partial`.
    pub fn init_budget(&self, num_levels: usize, partial: &[i64], reinitialize: bool) -> Result<()> {
        let mut stats = self.stats.lock();
        if reinitialize {
            stats.budget = None;
        }
        stats.budget_or_init(num_levels)?.reset_partial(partial);
        Ok(())
    }

    /// Remaining budget at `level`, creating an exhausted budget on first use
    pub fn time_left(&self, level: usize, num_levels: usize) -> Result<i64> {
        self.stats.lock().budget_or_init(num_levels)?.time_left(level)
    }

    /// Charge `elapsed` against the budget at `level`
    pub fn use_time(&self, elapsed: Duration, level: usize, num_levels: usize) -> Result<()> {
        let nanos = i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX);
        self.stats.lock().budget_or_init(num_levels)?.use_time(nanos, level)
    }

    /// Start the group's IO stopwatch
    pub fn start_io(&self) {
        self.stats.lock().start();
    }

    /// Stop the group's IO stopwatch and record a finished inline load
    pub fn stop_io(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.stop();
        stats.add_bytes(bytes);
        stats.inline_loads += 1;
    }

    /// Snapshot of the group's statistics
    pub fn snapshot(&self) -> IoSnapshot {
        let stats = self.stats.lock();
        IoSnapshot {
            io_time: Duration::from_nanos(stats.io_nanos()),
            io_bytes: stats.io_bytes,
            inline_loads: stats.inline_loads,
            budget: stats
                .budget
                .as_ref()
                .map(|budget| budget.levels().to_vec())
                .unwrap_or_default(),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new("default")
    }
}
