//! Priority fetch queue
//!
//! Pending asynchronous load requests are deposited into one lane per priority
//! level (0 is the most urgent) and withdrawn by fetcher threads in strict
//! priority order. Requests that were not serviced by the end of a frame are
//! not discarded: [`FetchQueue::clear`] demotes them into a bounded prefetch
//! lane that is only served once every priority lane is empty.

use crate::cancel::CancellationToken;
use crate::error::{Result, SchedulerError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default bound of the prefetch lane
pub const DEFAULT_PREFETCH_CAPACITY: usize = 16384;

/// Fetch queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total requests put into priority lanes
    pub puts: u64,

    /// Total requests handed out by `take`
    pub takes: u64,

    /// Requests moved from priority lanes into the prefetch lane by `clear`
    pub demoted: u64,

    /// Requests dropped because the prefetch lane was full
    pub dropped: u64,

    /// Requests currently pending (priority lanes plus prefetch)
    pub pending: usize,
}

struct QueueState<K> {
    /// One deque per priority level, index 0 is served first
    lanes: Vec<VecDeque<K>>,

    /// Best-effort leftovers from earlier frames
    prefetch: VecDeque<K>,

    /// Sum of all lane lengths plus the prefetch length
    count: usize,

    stats: QueueStats,
}

impl<K> QueueState<K> {
    fn pop_next(&mut self) -> Option<K> {
        let key = self
            .lanes
            .iter_mut()
            .find_map(|lane| lane.pop_front())
            .or_else(|| self.prefetch.pop_front())?;
        self.count -= 1;
        self.stats.takes += 1;
        Some(key)
    }
}

/// Blocking multi-lane priority queue
///
/// Thread-safe queue shared by foreground callers (which `put`) and fetcher
/// threads (which `take`). Any pending request at priority `p` is handed out
/// before any request at priority `p + 1`; within a lane requests come out in
/// insertion order unless they were put to the front.
///
/// # Example
///
/// ```
/// use cellstream_scheduler::FetchQueue;
///
/// let queue = FetchQueue::new(2);
/// queue.put("a", 0, false).unwrap();
/// queue.put("b", 1, false).unwrap();
/// queue.put("c", 0, true).unwrap();
///
/// assert_eq!(queue.try_take(), Some("c"));
/// assert_eq!(queue.try_take(), Some("a"));
/// assert_eq!(queue.try_take(), Some("b"));
/// ```
pub struct FetchQueue<K> {
    state: Mutex<QueueState<K>>,
    not_empty: Condvar,
    num_priorities: usize,
    prefetch_capacity: usize,
}

impl<K> FetchQueue<K> {
    /// Create a queue with `num_priorities` lanes and the default prefetch bound
    pub fn new(num_priorities: usize) -> Self {
        Self::with_prefetch_capacity(num_priorities, DEFAULT_PREFETCH_CAPACITY)
    }

    /// Create a queue with `num_priorities` lanes and a custom prefetch bound
    pub fn with_prefetch_capacity(num_priorities: usize, prefetch_capacity: usize) -> Self {
        let lanes = (0..num_priorities).map(|_| VecDeque::new()).collect();
        Self {
            state: Mutex::new(QueueState {
                lanes,
                prefetch: VecDeque::new(),
                count: 0,
                stats: QueueStats::default(),
            }),
            not_empty: Condvar::new(),
            num_priorities,
            prefetch_capacity,
        }
    }

    /// Add a request to the lane for `priority`
    ///
    /// With `to_front` the request is served before everything already
    /// pending in that lane (most recently requested first), otherwise it is
    /// appended. Wakes one waiting fetcher.
    pub fn put(&self, key: K, priority: usize, to_front: bool) -> Result<()> {
        if priority >= self.num_priorities {
            return Err(SchedulerError::PriorityOutOfRange {
                priority,
                levels: self.num_priorities,
            });
        }

        let mut state = self.state.lock();
        let lane = &mut state.lanes[priority];
        if to_front {
            lane.push_front(key);
        } else {
            lane.push_back(key);
        }
        state.count += 1;
        state.stats.puts += 1;
        drop(state);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Withdraw the next request, blocking while the queue is empty
    ///
    /// Returns `Err(SchedulerError::Cancelled)` once `token` is cancelled and
    /// the waiter has been woken through [`FetchQueue::interrupt`]. A
    /// cancelled wait leaves the queue untouched.
    pub fn take(&self, token: &CancellationToken) -> Result<K> {
        let mut state = self.state.lock();
        loop {
            token.check()?;
            if let Some(key) = state.pop_next() {
                return Ok(key);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Withdraw the next request, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn take_timeout(&self, timeout: Duration, token: &CancellationToken) -> Result<Option<K>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            token.check()?;
            if let Some(key) = state.pop_next() {
                return Ok(Some(key));
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.pop_next());
            }
        }
    }

    /// Withdraw the next request without blocking
    pub fn try_take(&self) -> Option<K> {
        self.state.lock().pop_next()
    }

    /// Wake every thread blocked in `take` so it re-checks its token
    pub fn interrupt(&self) {
        let _state = self.state.lock();
        self.not_empty.notify_all();
    }

    /// Demote all pending priority requests into the prefetch lane
    ///
    /// Lane 0 goes to the front of the prefetch lane in its current order,
    /// requests already in the prefetch lane follow, and lanes 1.. are
    /// appended to the back. When the result exceeds the prefetch capacity
    /// the previously prefetched requests are evicted first, then the tail.
    /// Returns the number of requests demoted from priority lanes.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut lanes = state.lanes.iter_mut();
        let first: VecDeque<K> = lanes.next().map(std::mem::take).unwrap_or_default();
        let rest: Vec<K> = lanes.flat_map(|lane| lane.drain(..)).collect();
        let demoted = first.len() + rest.len();

        let mut previous = std::mem::take(&mut state.prefetch);
        let room_for_previous = self
            .prefetch_capacity
            .saturating_sub(demoted);
        let mut dropped = previous.len().saturating_sub(room_for_previous);
        previous.truncate(room_for_previous);

        let mut prefetch = first;
        prefetch.append(&mut previous);
        prefetch.extend(rest);
        if prefetch.len() > self.prefetch_capacity {
            dropped += prefetch.len() - self.prefetch_capacity;
            prefetch.truncate(self.prefetch_capacity);
        }

        state.count = prefetch.len();
        state.prefetch = prefetch;
        state.stats.demoted += demoted as u64;
        state.stats.dropped += dropped as u64;
        demoted
    }

    /// Number of pending requests across all lanes
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    /// Check if no requests are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests waiting in the prefetch lane
    pub fn prefetch_len(&self) -> usize {
        self.state.lock().prefetch.len()
    }

    /// Number of priority lanes
    pub fn num_priorities(&self) -> usize {
        self.num_priorities
    }

    /// Bound of the prefetch lane
    pub fn prefetch_capacity(&self) -> usize {
        self.prefetch_capacity
    }

    /// Snapshot of queue statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.count,
            ..state.stats
        }
    }
}
