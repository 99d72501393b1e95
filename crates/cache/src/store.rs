//! Concurrent cell entry store
//!
//! Maps cell addresses to entries without keeping them alive by itself.
//! The map holds weak references only; an entry lives while a caller holds
//! its [`CellHandle`], and valid entries are additionally kept by the soft
//! retention tier until memory pressure drops them.
//!
//! Dropping the last reference to an entry logs its address. Dead map slots
//! are removed in bounded batches by [`CellEntryStore::reap_reclaimed`], which
//! visits only logged addresses. Requests reap once a full batch is pending;
//! the frame boundary reaps whatever is left.

use crate::address::CellAddress;
use crate::data::{CellData, Element};
use crate::entry::{CacheEntry, ReclaimLog};
use crate::memory_budget::MemoryBudgetConfig;
use crate::retention::{RetentionStats, SoftRetention};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Default number of map slots removed per reap sweep
pub const DEFAULT_REAP_BATCH: usize = 500;

/// Shared reference to a cache entry
pub type CellHandle<T> = Arc<CacheEntry<T>>;

/// Statistics of the entry store
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoreStats {
    /// Map slots, including dead ones not yet reaped
    pub slots: usize,

    /// Lookups that found a live entry
    pub hits: u64,

    /// Lookups that created a new entry
    pub misses: u64,

    /// Completed loads
    pub loads: u64,

    /// Dead slots removed by reap sweeps
    pub reaped: u64,

    /// Soft retention tier
    pub retention: RetentionStats,
}

impl StoreStats {
    /// Fraction of `get_or_create` calls served by a live entry
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    reaped: AtomicU64,
}

/// Two-tier store of cache entries
///
/// # Example
///
/// ```
/// use cellstream_cache::{CellAddress, CellData, CellEntryStore, MemoryBudgetConfig, PlaceholderPool};
///
/// let pool = PlaceholderPool::new();
/// let store = CellEntryStore::<u8>::new(MemoryBudgetConfig::with_limit_mb(16));
/// let address = CellAddress::new(0, 0, 0, 0);
///
/// let entry = store.get_or_create(address, || CellData::placeholder(&pool, vec![2, 2], vec![0, 0]));
/// assert!(!entry.is_valid());
///
/// let loaded = store
///     .load_if_invalid(&entry, |_| CellData::loaded(vec![1, 2, 3, 4], vec![2, 2], vec![0, 0]))
///     .unwrap();
/// assert!(loaded);
/// assert!(entry.is_valid());
/// ```
pub struct CellEntryStore<T> {
    entries: DashMap<CellAddress, Weak<CacheEntry<T>>>,
    retention: SoftRetention<T>,
    reclaimed: Arc<ReclaimLog>,
    reap_batch: usize,
    counters: StoreCounters,
}

impl<T: Element> CellEntryStore<T> {
    /// Create a store whose soft tier is bounded by `retention`
    pub fn new(retention: MemoryBudgetConfig) -> Self {
        Self {
            entries: DashMap::new(),
            retention: SoftRetention::new(retention),
            reclaimed: Arc::new(ReclaimLog::default()),
            reap_batch: DEFAULT_REAP_BATCH,
            counters: StoreCounters::default(),
        }
    }

    /// Set the number of slots removed per reap sweep
    pub fn with_reap_batch(mut self, reap_batch: usize) -> Self {
        self.reap_batch = reap_batch.max(1);
        self
    }

    /// Return the live entry for `key`, creating it with `factory` if needed
    ///
    /// At most one entry is live per address: creation happens under the
    /// map's lock for the address's shard.
    pub fn get_or_create<F>(&self, key: CellAddress, factory: F) -> CellHandle<T>
    where
        F: FnOnce() -> CellData<T>,
    {
        match self.get_or_try_create(key, || Ok::<_, Infallible>(factory())) {
            Ok(entry) => entry,
            Err(never) => match never {},
        }
    }

    /// Like [`CellEntryStore::get_or_create`] with a fallible factory
    ///
    /// A failing factory installs nothing.
    pub fn get_or_try_create<F, E>(&self, key: CellAddress, factory: F) -> Result<CellHandle<T>, E>
    where
        F: FnOnce() -> Result<CellData<T>, E>,
    {
        if self.reclaimed.len() >= self.reap_batch {
            self.reap_reclaimed();
        }

        let (entry, created) = match self.entries.entry(key) {
            Entry::Occupied(mut slot) => match slot.get().upgrade() {
                Some(entry) => (entry, false),
                None => {
                    let entry = self.create(key, factory()?);
                    slot.insert(Arc::downgrade(&entry));
                    (entry, true)
                }
            },
            Entry::Vacant(slot) => {
                let entry = self.create(key, factory()?);
                slot.insert(Arc::downgrade(&entry));
                (entry, true)
            }
        };

        if !created {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            if entry.is_valid() {
                self.retention.touch(&entry);
            }
        }
        Ok(entry)
    }

    fn create(&self, key: CellAddress, data: CellData<T>) -> CellHandle<T> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CacheEntry::new(key, data, Arc::clone(&self.reclaimed)));
        if entry.is_valid() {
            self.retention.insert(Arc::clone(&entry));
        }
        entry
    }

    /// Live entry for `key`, without creating one
    pub fn lookup(&self, key: &CellAddress) -> Option<CellHandle<T>> {
        let entry = self.entries.get(key)?.upgrade()?;
        if entry.is_valid() {
            self.retention.touch(&entry);
        }
        Some(entry)
    }

    /// Load `entry` unless it is already valid
    ///
    /// Concurrent callers for the same entry serialize on its load lock and
    /// re-check validity, so `loader` runs at most once per successful load.
    /// A failing loader leaves the entry invalid for a later retry.
    ///
    /// Returns whether this call performed the load.
    pub fn load_if_invalid<E, F>(&self, entry: &CellHandle<T>, loader: F) -> Result<bool, E>
    where
        F: FnOnce(&CellAddress) -> Result<CellData<T>, E>,
    {
        if entry.is_valid() {
            return Ok(false);
        }
        let _guard = entry.lock_load();
        if entry.is_valid() {
            return Ok(false);
        }

        let data = loader(entry.key())?;
        if !data.is_valid() {
            return Ok(false);
        }
        entry.set_loaded(data);
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        self.retention.insert(Arc::clone(entry));
        Ok(true)
    }

    /// Drop every reference held by the store itself
    ///
    /// Entries still held by callers stay live and reachable.
    pub fn evict_all(&self) -> usize {
        let released = self.retention.clear();
        debug!(released, "evicted all retained cells");
        released
    }

    /// Trim the soft tier if it is under memory pressure
    pub fn trim(&self) -> usize {
        self.retention.trim()
    }

    /// Remove the slots of up to one batch of reclaimed entries
    ///
    /// A slot whose address was recreated since is kept. Returns the number
    /// of slots removed.
    pub fn reap_reclaimed(&self) -> usize {
        let keys = self.reclaimed.take(self.reap_batch);
        if keys.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for key in &keys {
            if self
                .entries
                .remove_if(key, |_, weak| weak.strong_count() == 0)
                .is_some()
            {
                removed += 1;
            }
        }

        self.counters.reaped.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, pending = self.reclaimed.len(), "reaped reclaimed cell slots");
        }
        removed
    }

    /// Reclaimed entries whose slots await a reap
    pub fn pending_reclaims(&self) -> usize {
        self.reclaimed.len()
    }

    /// Number of map slots, including unreaped dead ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no slots
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live entries
    pub fn live_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|slot| slot.value().strong_count() > 0)
            .count()
    }

    /// Statistics of the store
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            slots: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
            retention: self.retention.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::PlaceholderPool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    fn store(limit: usize) -> CellEntryStore<u8> {
        CellEntryStore::new(MemoryBudgetConfig::with_limit_bytes(limit))
    }

    fn address(index: u64) -> CellAddress {
        CellAddress::new(0, 0, 0, index)
    }

    fn placeholder(pool: &PlaceholderPool) -> CellData<u8> {
        CellData::placeholder(pool, vec![4], vec![0])
    }

    fn loaded(value: u8) -> Result<CellData<u8>, String> {
        CellData::loaded(vec![value; 4], vec![4], vec![0]).map_err(|e| e.to_string())
    }

    #[test]
    fn test_get_or_create_returns_same_entry() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let a = store.get_or_create(address(1), || placeholder(&pool));
        let b = store.get_or_create(address(1), || placeholder(&pool));
        assert!(Arc::ptr_eq(&a, &b));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_single_creation_under_contention() {
        let pool = Arc::new(PlaceholderPool::new());
        let store = Arc::new(store(1024));
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (pool, store) = (Arc::clone(&pool), Arc::clone(&store));
                let (created, barrier) = (Arc::clone(&created), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    store.get_or_create(address(7), || {
                        created.fetch_add(1, Ordering::SeqCst);
                        placeholder(&pool)
                    })
                })
            })
            .collect();

        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_invalid_entry_is_weakly_held() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let entry = store.get_or_create(address(1), || placeholder(&pool));
        assert!(store.lookup(&address(1)).is_some());

        drop(entry);
        assert!(store.lookup(&address(1)).is_none());
        assert_eq!(store.live_entries(), 0);
    }

    #[test]
    fn test_valid_entry_is_softly_held() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let entry = store.get_or_create(address(1), || placeholder(&pool));
        store.load_if_invalid(&entry, |_| loaded(9)).unwrap();
        drop(entry);

        let entry = store.lookup(&address(1)).unwrap();
        assert_eq!(entry.data().as_slice(), &[9, 9, 9, 9]);
        drop(entry);

        assert_eq!(store.evict_all(), 1);
        assert!(store.lookup(&address(1)).is_none());
    }

    #[test]
    fn test_evict_all_keeps_external_references() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let entry = store.get_or_create(address(1), || placeholder(&pool));
        store.load_if_invalid(&entry, |_| loaded(1)).unwrap();

        store.evict_all();
        let found = store.lookup(&address(1)).unwrap();
        assert!(Arc::ptr_eq(&entry, &found));
    }

    #[test]
    fn test_load_if_invalid_loads_once() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let entry = store.get_or_create(address(1), || placeholder(&pool));

        assert_eq!(store.load_if_invalid(&entry, |_| loaded(3)), Ok(true));
        assert_eq!(store.load_if_invalid(&entry, |_| loaded(4)), Ok(false));
        assert_eq!(entry.data().as_slice(), &[3, 3, 3, 3]);
        assert_eq!(store.stats().loads, 1);
    }

    #[test]
    fn test_failed_load_leaves_entry_invalid() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let entry = store.get_or_create(address(1), || placeholder(&pool));

        let result = store.load_if_invalid(&entry, |_| Err::<CellData<u8>, _>("backend down"));
        assert_eq!(result, Err("backend down"));
        assert!(!entry.is_valid());
        assert_eq!(store.stats().retention.entries, 0);

        // Retried later
        assert_eq!(store.load_if_invalid(&entry, |_| loaded(1)), Ok(true));
    }

    #[test]
    fn test_concurrent_loads_run_loader_once() {
        let pool = PlaceholderPool::new();
        let store = Arc::new(store(1024));
        let entry = store.get_or_create(address(1), || placeholder(&pool));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let (store, entry) = (Arc::clone(&store), Arc::clone(&entry));
                let (calls, barrier) = (Arc::clone(&calls), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .load_if_invalid(&entry, |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            loaded(5)
                        })
                        .unwrap()
                })
            })
            .collect();

        let performed: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(performed, 1);
    }

    #[test]
    fn test_reap_removes_dead_slots_in_batches() {
        let pool = PlaceholderPool::new();
        let store = store(1024).with_reap_batch(3);
        for index in 0..5 {
            drop(store.get_or_create(address(index), || placeholder(&pool)));
        }
        // The fourth request found a full batch pending and reaped it
        assert_eq!(store.len(), 2);
        assert_eq!(store.pending_reclaims(), 2);

        while store.reap_reclaimed() > 0 {}
        assert_eq!(store.len(), 0);
        assert_eq!(store.stats().reaped, 5);
    }

    #[test]
    fn test_reap_batch_bound() {
        let pool = PlaceholderPool::new();
        let store = store(1024).with_reap_batch(2);
        let entries: Vec<_> = (0..6)
            .map(|index| store.get_or_create(address(index), || placeholder(&pool)))
            .collect();
        drop(entries);
        assert_eq!(store.len(), 6);

        assert_eq!(store.reap_reclaimed(), 2);
        assert_eq!(store.len(), 4);
        assert_eq!(store.reap_reclaimed(), 2);
        assert_eq!(store.reap_reclaimed(), 2);
        assert_eq!(store.reap_reclaimed(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_requests_below_batch_do_not_reap() {
        let pool = PlaceholderPool::new();
        let store = store(1 << 20).with_reap_batch(16);
        let retained: Vec<_> = (0..1000)
            .map(|index| {
                let entry = store.get_or_create(address(index), || placeholder(&pool));
                store.load_if_invalid(&entry, |_| loaded(1)).unwrap();
                entry
            })
            .collect();
        drop(retained);
        for index in 1000..1003 {
            drop(store.get_or_create(address(index), || placeholder(&pool)));
        }
        assert_eq!(store.pending_reclaims(), 3);

        // Hits on retained cells leave the dead slots alone
        for index in 0..1000 {
            assert!(store.get_or_create(address(index), || placeholder(&pool)).is_valid());
        }
        assert_eq!(store.len(), 1003);

        assert_eq!(store.reap_reclaimed(), 3);
        assert_eq!(store.len(), 1000);
        assert_eq!(store.pending_reclaims(), 0);
    }

    #[test]
    fn test_reap_keeps_recreated_slot() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        drop(store.get_or_create(address(1), || placeholder(&pool)));
        let second = store.get_or_create(address(1), || placeholder(&pool));
        assert_eq!(store.pending_reclaims(), 1);

        assert_eq!(store.reap_reclaimed(), 0);
        assert_eq!(store.pending_reclaims(), 0);
        let found = store.lookup(&address(1)).unwrap();
        assert!(Arc::ptr_eq(&second, &found));
    }

    #[test]
    fn test_failing_factory_installs_nothing() {
        let store = store(1024);
        let result = store.get_or_try_create(address(1), || Err::<CellData<u8>, _>("outside grid"));
        assert_eq!(result.err(), Some("outside grid"));
        assert!(store.is_empty());
        assert_eq!(store.stats().misses, 0);
    }

    #[test]
    fn test_recreate_after_reclaim() {
        let pool = PlaceholderPool::new();
        let store = store(1024);
        let first = store.get_or_create(address(1), || placeholder(&pool));
        let weak = Arc::downgrade(&first);
        drop(first);

        let second = store.get_or_create(address(1), || placeholder(&pool));
        assert!(weak.upgrade().is_none());
        assert!(!second.is_valid());
        assert_eq!(store.stats().misses, 2);
    }
}
