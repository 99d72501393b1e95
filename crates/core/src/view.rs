//! Per-source views on the cell cache
//!
//! A view fixes timepoint, setup and level and carries its own cache hints,
//! so different consumers can drive the same cache with different policies.

use crate::controller::VolatileCellCache;
use crate::error::Result;
use crate::grid::CellGrid;
use crate::strategy::{default_priority, CacheHints, LoadingStrategy};
use cellstream_cache::{CellAddress, CellHandle, Element};
use cellstream_scheduler::TaskGroup;

/// Cells of one (timepoint, setup, level)
pub struct CellView<'a, T: Element> {
    cache: &'a VolatileCellCache<T>,
    timepoint: u32,
    setup: u32,
    level: u32,
    hints: CacheHints,
}

impl<'a, T: Element> CellView<'a, T> {
    pub(crate) fn new(cache: &'a VolatileCellCache<T>, timepoint: u32, setup: u32, level: u32) -> Self {
        let max_level = cache.geometry().num_levels(setup).saturating_sub(1);
        let priority = default_priority(level as usize, max_level).min(cache.num_priorities() - 1);
        Self {
            cache,
            timepoint,
            setup,
            level,
            hints: CacheHints::new(LoadingStrategy::Volatile, priority, false),
        }
    }

    /// Replace the hints used by [`CellView::get`]
    pub fn set_cache_hints(&mut self, strategy: LoadingStrategy, priority: usize, enqueue_to_front: bool) {
        self.hints = CacheHints::new(strategy, priority, enqueue_to_front);
    }

    /// Builder form of [`CellView::set_cache_hints`]
    pub fn with_cache_hints(mut self, hints: CacheHints) -> Self {
        self.hints = hints;
        self
    }

    /// Hints currently in use
    pub fn cache_hints(&self) -> &CacheHints {
        &self.hints
    }

    /// Request cell `index` of this view
    pub fn get(&self, index: u64, group: &TaskGroup) -> Result<CellHandle<T>> {
        self.cache.request(self.address(index), &self.hints, group)
    }

    /// Address of cell `index` of this view
    pub fn address(&self, index: u64) -> CellAddress {
        CellAddress::new(self.timepoint, self.setup, self.level, index)
    }

    /// Cell grid of this view's level, if the geometry has one
    pub fn grid(&self) -> Option<&'a CellGrid> {
        let cache: &'a VolatileCellCache<T> = self.cache;
        cache.geometry().grid(self.setup, self.level)
    }

    /// Number of cells in this view
    pub fn num_cells(&self) -> u64 {
        self.grid().map_or(0, CellGrid::num_cells)
    }

    pub fn timepoint(&self) -> u32 {
        self.timepoint
    }

    pub fn setup(&self) -> u32 {
        self.setup
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::UniformGeometry;
    use crate::loader::CellLoader;
    use cellstream_cache::CacheConfig;
    use cellstream_scheduler::BoxError;
    use std::sync::Arc;
    use std::time::Duration;

    struct Ramp;

    impl CellLoader<f32> for Ramp {
        fn load(
            &self,
            _timepoint: u32,
            _setup: u32,
            _level: u32,
            dims: &[usize],
            min: &[i64],
        ) -> std::result::Result<Vec<f32>, BoxError> {
            let n: usize = dims.iter().product();
            Ok((0..n).map(|i| (min[0] as f32) + i as f32).collect())
        }
    }

    fn cache() -> VolatileCellCache<f32> {
        let geometry = UniformGeometry::new(2, vec![40], vec![16], 3).unwrap();
        let config = CacheConfig::default()
            .with_fetcher_threads(1)
            .with_fetcher_poll_ms(10);
        VolatileCellCache::<f32>::new(Arc::new(Ramp), Arc::new(geometry), &config).unwrap()
    }

    #[test]
    fn test_default_hints_favor_coarse_levels() {
        let cache = cache();
        assert_eq!(cache.view(0, 0, 0).cache_hints().priority, 2);
        assert_eq!(cache.view(0, 0, 2).cache_hints().priority, 0);
        assert_eq!(cache.view(0, 1, 1).cache_hints().strategy, LoadingStrategy::Volatile);
    }

    #[test]
    fn test_view_get_uses_its_hints() {
        let cache = cache();
        cache.pause_fetchers_for(Duration::from_secs(60));
        let group = TaskGroup::default();

        let mut view = cache.view(3, 1, 0);
        assert_eq!(view.num_cells(), 3);
        assert_eq!(view.address(2), CellAddress::new(3, 1, 0, 2));

        view.set_cache_hints(LoadingStrategy::Blocking, 1, true);
        let cell = view.get(2, &group).unwrap();
        assert!(cell.is_valid());
        assert_eq!(cell.data().as_slice(), &[32.0, 33.0, 34.0, 35.0, 36.0, 37.0, 38.0, 39.0]);
        assert_eq!(cache.stats().enqueued, 0);
    }

    #[test]
    fn test_views_share_the_cache() {
        let cache = cache();
        let group = TaskGroup::default();

        let blocking = cache
            .view(0, 0, 1)
            .with_cache_hints(CacheHints::new(LoadingStrategy::Blocking, 0, false));
        let passive = cache
            .view(0, 0, 1)
            .with_cache_hints(CacheHints::new(LoadingStrategy::DontLoad, 0, false));

        let loaded = blocking.get(0, &group).unwrap();
        let seen = passive.get(0, &group).unwrap();
        assert!(Arc::ptr_eq(&loaded, &seen));
        assert!(seen.is_valid());
    }

    #[test]
    fn test_view_outside_geometry() {
        let cache = cache();
        let view = cache.view(0, 5, 0);
        assert!(view.grid().is_none());
        assert_eq!(view.num_cells(), 0);
        assert!(view.get(0, &TaskGroup::default()).is_err());
    }
}
