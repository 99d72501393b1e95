//! Cache entries

use crate::address::CellAddress;
use crate::data::{CellData, Element};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Enqueue frame of an entry that was never enqueued
pub const NOT_ENQUEUED: i64 = -1;

/// Enqueue frame of a valid entry; never less than any frame
pub const LOADED: i64 = i64::MAX;

/// Addresses of dropped entries whose map slots have not been reaped yet
#[derive(Debug, Default)]
pub(crate) struct ReclaimLog {
    keys: Mutex<VecDeque<CellAddress>>,
    pending: AtomicUsize,
}

impl ReclaimLog {
    fn push(&self, key: CellAddress) {
        let mut keys = self.keys.lock();
        keys.push_back(key);
        self.pending.store(keys.len(), Ordering::Relaxed);
    }

    /// Number of addresses waiting to be reaped; read without locking
    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Take up to `max` of the oldest addresses
    pub(crate) fn take(&self, max: usize) -> Vec<CellAddress> {
        let mut keys = self.keys.lock();
        let count = max.min(keys.len());
        let taken = keys.drain(..count).collect();
        self.pending.store(keys.len(), Ordering::Relaxed);
        taken
    }
}

/// One cell in the cache
///
/// The data is replaced wholesale when the cell is loaded, so readers that
/// already hold an `Arc<CellData<T>>` keep a consistent view.
#[derive(Debug)]
pub struct CacheEntry<T> {
    key: CellAddress,
    data: RwLock<Arc<CellData<T>>>,
    enqueue_frame: AtomicI64,
    load_lock: Mutex<()>,
    last_access: AtomicU64,
    reclaimed: Arc<ReclaimLog>,
}

impl<T: Element> CacheEntry<T> {
    /// Create an entry whose address is logged to `reclaimed` on drop
    pub(crate) fn new(key: CellAddress, data: CellData<T>, reclaimed: Arc<ReclaimLog>) -> Self {
        let enqueue_frame = if data.is_valid() { LOADED } else { NOT_ENQUEUED };
        Self {
            key,
            data: RwLock::new(Arc::new(data)),
            enqueue_frame: AtomicI64::new(enqueue_frame),
            load_lock: Mutex::new(()),
            last_access: AtomicU64::new(0),
            reclaimed,
        }
    }

    /// Address of this entry
    pub fn key(&self) -> &CellAddress {
        &self.key
    }

    /// Current data, possibly an invalid placeholder
    pub fn data(&self) -> Arc<CellData<T>> {
        Arc::clone(&self.data.read())
    }

    /// Whether the data has been loaded
    pub fn is_valid(&self) -> bool {
        self.data.read().is_valid()
    }

    /// Frame this entry was last enqueued in
    pub fn enqueue_frame(&self) -> i64 {
        self.enqueue_frame.load(Ordering::Acquire)
    }

    /// Claim the right to enqueue this entry in `frame`
    ///
    /// Returns true at most once per frame, and never once the entry is
    /// valid.
    pub fn try_mark_enqueued(&self, frame: i64) -> bool {
        self.enqueue_frame
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < frame).then_some(frame)
            })
            .is_ok()
    }

    /// Latest access stamp; 0 if never stamped
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Raise the access stamp to `stamp`; older stamps are ignored
    pub(crate) fn mark_accessed(&self, stamp: u64) {
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
    }

    pub(crate) fn lock_load(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock()
    }

    /// Install loaded data; the caller holds the load lock
    pub(crate) fn set_loaded(&self, data: CellData<T>) {
        *self.data.write() = Arc::new(data);
        self.enqueue_frame.store(LOADED, Ordering::Release);
    }

    /// Memory owned by the current data
    pub fn size_in_bytes(&self) -> usize {
        self.data.read().size_in_bytes()
    }
}

impl<T> Drop for CacheEntry<T> {
    fn drop(&mut self) {
        self.reclaimed.push(self.key);
    }
}
