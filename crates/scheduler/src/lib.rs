//! Cellstream Scheduler Library
//!
//! Priority fetch queue, IO time budgets and background fetchers.
//!
//! This crate schedules asynchronous cell loads for the cell cache. Requests
//! are queued by priority (0 is the most urgent) and withdrawn by a pool of
//! fetcher threads. Foreground threads that load synchronously are throttled
//! by a per-task-group IO time budget.
//!
//! # Example
//!
//! ```
//! use cellstream_scheduler::{CancellationToken, FetchQueue, TaskGroup};
//!
//! let queue = FetchQueue::new(3);
//! queue.put("coarse", 0, false).unwrap();
//! queue.put("fine", 2, false).unwrap();
//!
//! // Unserviced requests degrade into prefetch at the frame boundary
//! queue.clear();
//! assert_eq!(queue.prefetch_len(), 2);
//! assert_eq!(queue.take(&CancellationToken::new()), Ok("coarse"));
//!
//! // Each render pass initializes its group's budget (nanoseconds per level)
//! let group = TaskGroup::new("render");
//! group.init_budget(3, &[2_000_000, 1_000_000], true).unwrap();
//! ```

mod cancel;
mod error;
mod fetch_queue;
mod io;
mod io_budget;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use error::{Result, SchedulerError};
pub use fetch_queue::{FetchQueue, QueueStats, DEFAULT_PREFETCH_CAPACITY};
pub use io::{IoSnapshot, IoStatistics, TaskGroup};
pub use io_budget::IoTimeBudget;
pub use worker::{
    BoxError, FetchExecutor, FetcherConfig, FetcherHold, FetcherPool, FetcherStats,
    DEFAULT_POLL_INTERVAL,
};
