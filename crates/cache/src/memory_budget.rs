//! Byte budget for the soft retention tier
//!
//! Valid cells that nobody references any more are kept around for a while
//! in case they are requested again. This module bounds how many bytes such
//! retained cells may occupy and reports memory pressure so the store can
//! trim itself before it hits the hard limit.

use std::sync::atomic::{AtomicUsize, Ordering};

const MB: usize = 1024 * 1024;

/// Memory pressure level of a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below half of the budget
    Low,
    /// Between half and three quarters
    Moderate,
    /// Between three quarters and 90%
    High,
    /// Above 90%
    Critical,
}

impl MemoryPressure {
    /// Pressure level for a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// High or Critical pressure calls for trimming
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Limits of a memory budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudgetConfig {
    /// Hard limit in bytes
    pub limit: usize,
    /// Utilization the store trims down to (0.0 to 1.0)
    pub target_utilization: f64,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            limit: 1024 * MB,
            target_utilization: 0.80,
        }
    }
}

impl MemoryBudgetConfig {
    /// Configuration with a limit in megabytes
    pub fn with_limit_mb(limit_mb: usize) -> Self {
        Self::with_limit_bytes(limit_mb.saturating_mul(MB))
    }

    /// Configuration with a limit in bytes
    pub fn with_limit_bytes(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Set the utilization trimmed down to (0.0 to 1.0)
    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target.clamp(0.0, 1.0);
        self
    }

    /// Target usage in bytes
    pub fn target_bytes(&self) -> usize {
        (self.limit as f64 * self.target_utilization) as usize
    }
}

/// Running byte count against a limit
///
/// # Example
///
/// ```
/// use cellstream_cache::{MemoryBudget, MemoryBudgetConfig, MemoryPressure};
///
/// let budget = MemoryBudget::new(MemoryBudgetConfig::with_limit_bytes(1000));
/// assert!(budget.can_allocate(1000));
///
/// budget.record_allocation(800);
/// assert!(!budget.can_allocate(300));
/// assert_eq!(budget.pressure(), MemoryPressure::High);
/// assert_eq!(budget.bytes_to_evict(), 0);
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    config: MemoryBudgetConfig,
    usage: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self {
            config,
            usage: AtomicUsize::new(0),
        }
    }

    /// Create a budget limited to `limit_mb` megabytes
    pub fn with_limit_mb(limit_mb: usize) -> Self {
        Self::new(MemoryBudgetConfig::with_limit_mb(limit_mb))
    }

    /// Bytes currently accounted
    pub fn current_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Hard limit in bytes
    pub fn limit(&self) -> usize {
        self.config.limit
    }

    /// Bytes left before the limit
    pub fn available(&self) -> usize {
        self.config.limit.saturating_sub(self.current_usage())
    }

    /// Usage relative to the limit
    pub fn utilization(&self) -> f64 {
        if self.config.limit == 0 {
            0.0
        } else {
            self.current_usage() as f64 / self.config.limit as f64
        }
    }

    /// Current pressure level
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Whether `bytes` more would still fit
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) <= self.config.limit
    }

    /// Account an allocation
    pub fn record_allocation(&self, bytes: usize) {
        self.usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account a release
    pub fn record_deallocation(&self, bytes: usize) {
        self.usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Forget all accounted bytes
    pub fn reset(&self) {
        self.usage.store(0, Ordering::Relaxed);
    }

    /// Bytes to release to get back to the target utilization
    pub fn bytes_to_evict(&self) -> usize {
        self.current_usage()
            .saturating_sub(self.config.target_bytes())
    }

    /// Whether the pressure calls for trimming
    pub fn needs_eviction(&self) -> bool {
        self.pressure().needs_eviction()
    }

    /// The configured limits
    pub fn config(&self) -> &MemoryBudgetConfig {
        &self.config
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(MemoryBudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_memory_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.3), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.6), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(0.95), MemoryPressure::Critical);

        assert!(!MemoryPressure::Moderate.needs_eviction());
        assert!(MemoryPressure::High.needs_eviction());
    }

    #[test]
    fn test_config() {
        let config = MemoryBudgetConfig::with_limit_mb(10).with_target_utilization(1.5);
        assert_eq!(config.limit, 10 * MB);
        assert_eq!(config.target_utilization, 1.0);
        assert_eq!(config.target_bytes(), 10 * MB);
    }

    #[test]
    fn test_allocation_accounting() {
        let budget = MemoryBudget::with_limit_mb(100);
        assert_eq!(budget.limit(), 100 * MB);
        assert_eq!(budget.pressure(), MemoryPressure::Low);

        budget.record_allocation(50 * MB);
        assert_eq!(budget.available(), 50 * MB);
        assert_eq!(budget.utilization(), 0.5);
        assert_eq!(budget.pressure(), MemoryPressure::Moderate);

        budget.record_deallocation(20 * MB);
        assert_eq!(budget.current_usage(), 30 * MB);

        // Releasing more than accounted saturates at zero
        budget.record_deallocation(100 * MB);
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_eviction_to_target() {
        let budget = MemoryBudget::new(MemoryBudgetConfig::with_limit_bytes(1000));
        budget.record_allocation(950);
        assert!(budget.needs_eviction());
        assert_eq!(budget.bytes_to_evict(), 150);

        budget.record_deallocation(150);
        assert_eq!(budget.bytes_to_evict(), 0);

        budget.reset();
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_zero_limit() {
        let budget = MemoryBudget::new(MemoryBudgetConfig::with_limit_bytes(0));
        assert_eq!(budget.utilization(), 0.0);
        assert!(budget.can_allocate(0));
        assert!(!budget.can_allocate(1));
    }

    #[test]
    fn test_concurrent_accounting() {
        let budget = Arc::new(MemoryBudget::with_limit_mb(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        budget.record_allocation(3);
                        budget.record_deallocation(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(budget.current_usage(), 8 * 1000 * 2);
    }
}
