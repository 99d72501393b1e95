//! Scheduler error types.

use thiserror::Error;

/// Errors raised by the fetch queue and the IO time budget.
///
/// All variants except [`SchedulerError::Cancelled`] are precondition
/// violations: the caller passed an index the structure was not built for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Priority lane index beyond the number of lanes the queue was built with
    #[error("priority {priority} out of range (queue has {levels} priority lanes)")]
    PriorityOutOfRange { priority: usize, levels: usize },

    /// Budget level index beyond the number of levels the budget was built with
    #[error("budget level {level} out of range (budget has {levels} levels)")]
    LevelOutOfRange { level: usize, levels: usize },

    /// A budget was built or reset from an empty per-level array
    #[error("IO time budget needs at least one level")]
    EmptyBudget,

    /// A blocking wait was interrupted through its cancellation token
    #[error("wait cancelled")]
    Cancelled,
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
