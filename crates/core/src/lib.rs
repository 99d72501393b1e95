//! Cellstream Core Library
//!
//! Asynchronous, priority-aware, budget-constrained cell cache for image
//! volumes too large to hold in memory.
//!
//! Images are cut into cells per timepoint, setup and resolution level. The
//! renderer requests cells from a [`VolatileCellCache`] with a
//! [`LoadingStrategy`]. The cache either returns data that is already
//! loaded, loads it on the calling thread (bounded by the caller's IO time
//! budget for `Budgeted`), or hands the cell to background fetchers and
//! returns a placeholder that turns valid in place once loaded.

pub mod controller;
pub mod error;
pub mod grid;
pub mod loader;
pub mod strategy;
pub mod view;

pub use controller::{ControllerStats, RequestCounts, VolatileCellCache};
pub use error::{CacheError, Result};
pub use grid::{CellBlock, CellGeometry, CellGrid, GridError, UniformGeometry};
pub use loader::CellLoader;
pub use strategy::{default_priority, CacheHints, LoadingStrategy, ParseStrategyError};
pub use view::CellView;
