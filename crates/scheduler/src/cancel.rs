//! Shutdown signal shared between a fetcher pool and its threads
//!
//! A fetcher blocked in [`FetchQueue::take`](crate::FetchQueue::take) observes its
//! token when it is woken. Cancelling a token alone does not wake anyone; the
//! owner of the queue follows up with [`FetchQueue::interrupt`](crate::FetchQueue::interrupt).

use crate::error::{Result, SchedulerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way cancellation flag; clones observe the same flag
///
/// # Example
///
/// ```
/// use cellstream_scheduler::{CancellationToken, SchedulerError};
///
/// let pool_token = CancellationToken::new();
/// let fetcher_token = pool_token.clone();
/// assert!(fetcher_token.check().is_ok());
///
/// assert!(pool_token.cancel());
/// assert_eq!(fetcher_token.check(), Err(SchedulerError::Cancelled));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` for the call that actually raised it.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(SchedulerError::Cancelled)` once the flag is raised
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SchedulerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
