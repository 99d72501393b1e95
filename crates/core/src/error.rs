//! Cell cache error types.

use cellstream_cache::{CellAddress, ConfigError};
use cellstream_scheduler::{BoxError, SchedulerError};
use thiserror::Error;

/// Errors returned by the cell cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend failed to load a cell; the cell stays invalid
    #[error("failed to load cell {address}: {source}")]
    Load {
        address: CellAddress,
        source: BoxError,
    },

    /// The address has no cell in the configured geometry
    #[error("cell {address} is outside the cell grid")]
    InvalidAddress { address: CellAddress },

    /// Priority or budget level out of range
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Invalid cache configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Fetcher threads could not be spawned
    #[error("failed to spawn fetcher threads: {0}")]
    Spawn(#[source] std::io::Error),

    /// Request needing a load after the cache was shut down
    #[error("cell cache has been shut down")]
    Shutdown,
}

/// Result alias for cell cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
