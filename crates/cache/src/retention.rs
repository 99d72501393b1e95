//! Soft retention tier
//!
//! Holds strong references to valid entries in least-recently-used order,
//! bounded by a [`MemoryBudget`]. An entry dropped from this tier survives
//! only while something outside the cache still holds it.
//!
//! Recency is tracked without the tier lock: a touch raises the access stamp
//! on the entry itself. Queue records keep the stamp they were queued with,
//! and eviction gives a record whose entry was touched since then another
//! pass at the back of the queue instead of dropping it. Re-inserting an
//! entry leaves its old record behind to be skipped when it reaches the front.

use crate::address::CellAddress;
use crate::data::Element;
use crate::entry::CacheEntry;
use crate::memory_budget::{MemoryBudget, MemoryBudgetConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Statistics of the soft retention tier
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetentionStats {
    /// Number of retained entries
    pub entries: usize,

    /// Bytes held by retained entries
    pub memory_used: usize,

    /// Byte limit of the tier
    pub memory_limit: usize,

    /// Entries dropped to respect the limit
    pub evictions: u64,
}

impl RetentionStats {
    /// Memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }
}

struct Retained<T> {
    entry: Arc<CacheEntry<T>>,
    size: usize,
    stamp: u64,
}

struct RetentionState<T> {
    entries: HashMap<CellAddress, Retained<T>>,

    /// Oldest at front; records whose stamp no longer matches are stale
    lru_queue: VecDeque<(CellAddress, u64)>,

    evictions: u64,
}

impl<T: Element> RetentionState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            evictions: 0,
        }
    }

    /// Pop the least recently used entry
    ///
    /// Each entry is requeued at most once per call, so a tier whose every
    /// entry was touched still evicts its oldest.
    fn evict_lru(&mut self, budget: &MemoryBudget) -> Option<Arc<CacheEntry<T>>> {
        let mut requeues = self.entries.len();
        while let Some((key, stamp)) = self.lru_queue.pop_front() {
            let Some(retained) = self.entries.get_mut(&key) else {
                continue;
            };
            if retained.stamp != stamp {
                continue;
            }
            let accessed = retained.entry.last_access();
            if accessed > stamp && requeues > 0 {
                requeues -= 1;
                retained.stamp = accessed;
                self.lru_queue.push_back((key, accessed));
                continue;
            }
            if let Some(retained) = self.entries.remove(&key) {
                budget.record_deallocation(retained.size);
                self.evictions += 1;
                return Some(retained.entry);
            }
        }
        None
    }

    /// Drop stale records once they dominate the queue
    fn compact(&mut self) {
        if self.lru_queue.len() > 2 * self.entries.len() + 64 {
            let entries = &self.entries;
            self.lru_queue.retain(|(key, stamp)| {
                entries.get(key).is_some_and(|retained| retained.stamp == *stamp)
            });
        }
    }
}

/// LRU set of valid entries bounded by bytes
pub struct SoftRetention<T> {
    state: Mutex<RetentionState<T>>,
    budget: MemoryBudget,
    clock: AtomicU64,
}

impl<T: Element> SoftRetention<T> {
    /// Create a tier with the given byte budget
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self {
            state: Mutex::new(RetentionState::new()),
            budget: MemoryBudget::new(config),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Retain `entry` as most recently used
    ///
    /// Least recently used entries are dropped until it fits. An entry
    /// larger than the whole budget is not retained.
    pub fn insert(&self, entry: Arc<CacheEntry<T>>) {
        let size = entry.size_in_bytes();
        let key = *entry.key();
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(old) = state.entries.remove(&key) {
                self.budget.record_deallocation(old.size);
            }
            if size > self.budget.limit() {
                return;
            }
            while !self.budget.can_allocate(size) {
                match state.evict_lru(&self.budget) {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            let stamp = self.tick();
            entry.mark_accessed(stamp);
            state.lru_queue.push_back((key, stamp));
            state.entries.insert(key, Retained { entry, size, stamp });
            self.budget.record_allocation(size);
            state.compact();
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cells from soft retention");
        }
        // Entries may be reclaimed here, outside the lock
        drop(evicted);
    }

    /// Mark `entry` as most recently used
    ///
    /// Does not take the tier lock; eviction orders entries lazily.
    pub fn touch(&self, entry: &CacheEntry<T>) {
        entry.mark_accessed(self.tick());
    }

    /// Whether `key` is retained
    pub fn contains(&self, key: &CellAddress) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Drop entries until usage is back at the target utilization
    ///
    /// Only acts under high memory pressure. Returns the number of entries
    /// dropped.
    pub fn trim(&self) -> usize {
        if !self.budget.needs_eviction() {
            return 0;
        }
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while self.budget.bytes_to_evict() > 0 {
                match state.evict_lru(&self.budget) {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            state.compact();
        }
        let count = evicted.len();
        if count > 0 {
            debug!(count, "trimmed soft retention to target");
        }
        count
    }

    /// Drop every retained entry
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.lru_queue.clear();
            self.budget.reset();
            state.entries.drain().map(|(_, retained)| retained.entry).collect()
        };
        drained.len()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entry is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics of this tier
    pub fn stats(&self) -> RetentionStats {
        let state = self.state.lock();
        RetentionStats {
            entries: state.entries.len(),
            memory_used: self.budget.current_usage(),
            memory_limit: self.budget.limit(),
            evictions: state.evictions,
        }
    }

    /// The byte budget of this tier
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellData;
    use crate::entry::ReclaimLog;
    use std::thread;

    fn loaded_entry(index: u64, bytes: usize) -> Arc<CacheEntry<u8>> {
        let data = CellData::loaded(vec![0u8; bytes], vec![bytes], vec![0]).unwrap();
        Arc::new(CacheEntry::new(
            CellAddress::new(0, 0, 0, index),
            data,
            Arc::new(ReclaimLog::default()),
        ))
    }

    #[test]
    fn test_insert_and_stats() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000));
        tier.insert(loaded_entry(1, 100));
        tier.insert(loaded_entry(2, 200));

        let stats = tier.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.memory_used, 300);
        assert_eq!(stats.memory_limit, 1000);
        assert_eq!(stats.evictions, 0);
        assert!((stats.memory_utilization() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(300));
        let first = loaded_entry(1, 100);
        tier.insert(Arc::clone(&first));
        tier.insert(loaded_entry(2, 100));
        tier.insert(loaded_entry(3, 100));

        // 1 becomes most recently used, so 2 goes first
        tier.touch(&first);
        tier.insert(loaded_entry(4, 100));

        assert!(tier.contains(&CellAddress::new(0, 0, 0, 1)));
        assert!(!tier.contains(&CellAddress::new(0, 0, 0, 2)));
        assert!(tier.contains(&CellAddress::new(0, 0, 0, 3)));
        assert!(tier.contains(&CellAddress::new(0, 0, 0, 4)));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_evicted_entry_is_released() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(100));
        let first = loaded_entry(1, 100);
        let weak = Arc::downgrade(&first);
        tier.insert(first);
        assert!(weak.upgrade().is_some());

        tier.insert(loaded_entry(2, 100));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_oversized_entry_not_retained() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(50));
        tier.insert(loaded_entry(1, 20));
        tier.insert(loaded_entry(2, 80));
        assert_eq!(tier.len(), 1);
        assert!(tier.contains(&CellAddress::new(0, 0, 0, 1)));
    }

    #[test]
    fn test_reinsert_replaces() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000));
        let entry = loaded_entry(1, 100);
        tier.insert(Arc::clone(&entry));
        tier.insert(entry);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stats().memory_used, 100);
    }

    #[test]
    fn test_touch_unretained_entry() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(10));
        let entry = loaded_entry(9, 100);
        tier.touch(&entry);
        assert!(entry.last_access() > 0);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_all_touched_still_evicts_oldest() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(300));
        let entries: Vec<_> = (1..=3).map(|index| loaded_entry(index, 100)).collect();
        for entry in &entries {
            tier.insert(Arc::clone(entry));
        }
        for entry in &entries {
            tier.touch(entry);
        }

        tier.insert(loaded_entry(4, 100));
        assert_eq!(tier.len(), 3);
        assert!(!tier.contains(&CellAddress::new(0, 0, 0, 1)));
        assert!(tier.contains(&CellAddress::new(0, 0, 0, 4)));
    }

    #[test]
    fn test_touch_does_not_take_lock() {
        let tier = Arc::new(SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000)));
        let entry = loaded_entry(1, 10);
        tier.insert(Arc::clone(&entry));

        let guard = tier.state.lock();
        let touched = {
            let tier = Arc::clone(&tier);
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                for _ in 0..100 {
                    tier.touch(&entry);
                }
                entry.last_access()
            })
        };
        let stamp = touched.join().unwrap();
        drop(guard);

        assert!(stamp > tier.state.lock().entries[&CellAddress::new(0, 0, 0, 1)].stamp);
    }

    #[test]
    fn test_trim_under_pressure() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000));
        for index in 0..9 {
            tier.insert(loaded_entry(index, 100));
        }
        // 90% used, trimmed down to the 80% target
        assert_eq!(tier.trim(), 1);
        assert_eq!(tier.stats().memory_used, 800);
        assert!(!tier.contains(&CellAddress::new(0, 0, 0, 0)));

        // 80% is still high pressure but already at target
        assert_eq!(tier.trim(), 0);
    }

    #[test]
    fn test_clear() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000));
        tier.insert(loaded_entry(1, 100));
        tier.insert(loaded_entry(2, 100));
        assert_eq!(tier.clear(), 2);
        assert!(tier.is_empty());
        assert_eq!(tier.stats().memory_used, 0);
    }

    #[test]
    fn test_many_reinserts_stay_compact() {
        let tier = SoftRetention::new(MemoryBudgetConfig::with_limit_bytes(1000));
        let entry = loaded_entry(1, 10);
        for _ in 0..10_000 {
            tier.insert(Arc::clone(&entry));
            tier.touch(&entry);
        }
        assert_eq!(tier.len(), 1);
        assert!(tier.state.lock().lru_queue.len() <= 2 + 64 + 1);
    }
}
