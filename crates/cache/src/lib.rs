//! Cellstream Cache Library
//!
//! Cell addresses, cell data and the two-tier cache entry store.
//!
//! Entries are reachable through a concurrent map of weak references.
//! Placeholder (not yet loaded) entries live only while a caller holds
//! them; loaded entries are also retained in an LRU tier bounded by a byte
//! budget, so recently used cells survive between render passes.

pub mod address;
pub mod config;
pub mod data;
pub mod entry;
pub mod memory_budget;
pub mod placeholder;
pub mod retention;
pub mod store;

pub use address::CellAddress;
pub use config::{CacheConfig, ConfigError};
pub use data::{num_elements, CellData, DataError, Element};
pub use entry::CacheEntry;
pub use memory_budget::{MemoryBudget, MemoryBudgetConfig, MemoryPressure};
pub use placeholder::PlaceholderPool;
pub use retention::{RetentionStats, SoftRetention};
pub use store::{CellEntryStore, CellHandle, StoreStats, DEFAULT_REAP_BATCH};
