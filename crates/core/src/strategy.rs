//! Loading strategies and cache hints

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What a request does about a cell that is not loaded yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadingStrategy {
    /// Enqueue for the fetchers and return immediately
    #[default]
    Volatile,

    /// Load synchronously, blocking the caller for the full load
    Blocking,

    /// Load synchronously while the caller's IO time budget lasts,
    /// otherwise behave like `Volatile`
    Budgeted,

    /// Return whatever is cached, never load or enqueue
    DontLoad,
}

impl LoadingStrategy {
    /// All strategies, in declaration order
    pub const ALL: [LoadingStrategy; 4] = [
        LoadingStrategy::Volatile,
        LoadingStrategy::Blocking,
        LoadingStrategy::Budgeted,
        LoadingStrategy::DontLoad,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadingStrategy::Volatile => "volatile",
            LoadingStrategy::Blocking => "blocking",
            LoadingStrategy::Budgeted => "budgeted",
            LoadingStrategy::DontLoad => "dontload",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for LoadingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown loading strategy name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown loading strategy '{0}' (expected volatile, blocking, budgeted or dontload)")]
pub struct ParseStrategyError(String);

impl FromStr for LoadingStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "volatile" => Ok(LoadingStrategy::Volatile),
            "blocking" => Ok(LoadingStrategy::Blocking),
            "budgeted" => Ok(LoadingStrategy::Budgeted),
            "dontload" => Ok(LoadingStrategy::DontLoad),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

/// How requests from one source are served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheHints {
    /// Strategy for cells that are not loaded
    pub strategy: LoadingStrategy,

    /// Queue priority and budget level, 0 is most urgent
    pub priority: usize,

    /// Enqueue ahead of older requests of the same priority
    pub enqueue_to_front: bool,
}

impl CacheHints {
    pub fn new(strategy: LoadingStrategy, priority: usize, enqueue_to_front: bool) -> Self {
        Self {
            strategy,
            priority,
            enqueue_to_front,
        }
    }
}

/// Default priority of resolution `level` in a pyramid of `max_level + 1`
/// levels
///
/// Coarser levels get more urgent priorities so that something is shown
/// quickly.
///
/// ```
/// use cellstream_core::default_priority;
///
/// assert_eq!(default_priority(3, 3), 0);
/// assert_eq!(default_priority(0, 3), 3);
/// ```
pub fn default_priority(level: usize, max_level: usize) -> usize {
    max_level.saturating_sub(level)
}
