//! IO time budget for bounded blocking loads
//!
//! A render pass may spend only a limited amount of time blocking on
//! synchronous cell loads. The budget is kept per priority level and is
//! hierarchical: spending at level `l` also consumes the allowance of every
//! more urgent level `0..l`, and a less urgent level never has more time left
//! than a more urgent one. Cheap high-priority loads therefore keep some
//! guaranteed time even when coarse levels have exhausted theirs.
//!
//! All values are nanoseconds.

use crate::error::{Result, SchedulerError};

/// Per-level ledger of remaining blocking IO time
///
/// Invariant: `budget[i] <= budget[i - 1]` for every `i > 0`, established on
/// construction and after every [`IoTimeBudget::use_time`].
///
/// # Example
///
/// ```
/// use cellstream_scheduler::IoTimeBudget;
///
/// let mut budget = IoTimeBudget::new(&[100, 100, 50]).unwrap();
/// budget.use_time(60, 0).unwrap();
/// assert_eq!(budget.levels(), &[40, 40, 40]);
///
/// budget.reset();
/// assert_eq!(budget.levels(), &[100, 100, 50]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoTimeBudget {
    budget: Vec<i64>,
    initial: Vec<i64>,
}

impl IoTimeBudget {
    /// Create a budget from per-level initial values
    ///
    /// Values that would break the monotonic invariant are clamped down to
    /// the previous level's value.
    pub fn new(initial: &[i64]) -> Result<Self> {
        if initial.is_empty() {
            return Err(SchedulerError::EmptyBudget);
        }
        let mut initial = initial.to_vec();
        clamp_monotonic(&mut initial, 1);
        Ok(Self {
            budget: initial.clone(),
            initial,
        })
    }

    /// Create a budget with `num_levels` levels, all exhausted
    pub fn exhausted(num_levels: usize) -> Result<Self> {
        Self::new(&vec![0; num_levels])
    }

    /// Restore every level to its initial value
    pub fn reset(&mut self) {
        self.budget.copy_from_slice(&self.initial);
    }

    /// Reinitialize from a possibly shorter per-level array
    ///
    /// Levels beyond the end of `partial` take its last value. The result
    /// becomes the new initial budget. An empty `partial` exhausts all levels.
    pub fn reset_partial(&mut self, partial: &[i64]) {
        match partial.last() {
            None => self.initial.fill(0),
            Some(&last) => {
                for (level, value) in self.initial.iter_mut().enumerate() {
                    *value = partial.get(level).copied().unwrap_or(last);
                }
                clamp_monotonic(&mut self.initial, 1);
            }
        }
        self.reset();
    }

    /// Exhaust every level without touching the initial budget
    pub fn clear(&mut self) {
        self.budget.fill(0);
    }

    /// Remaining nanoseconds at `level`
    pub fn time_left(&self, level: usize) -> Result<i64> {
        self.budget
            .get(level)
            .copied()
            .ok_or(SchedulerError::LevelOutOfRange {
                level,
                levels: self.budget.len(),
            })
    }

    /// Spend `elapsed` nanoseconds at `level`
    ///
    /// Subtracts from levels `0..=level`, then clamps the following levels
    /// so the monotonic invariant holds again.
    pub fn use_time(&mut self, elapsed: i64, level: usize) -> Result<()> {
        let levels = self.budget.len();
        if level >= levels {
            return Err(SchedulerError::LevelOutOfRange { level, levels });
        }
        for value in &mut self.budget[..=level] {
            *value -= elapsed;
        }
        clamp_monotonic(&mut self.budget, level + 1);
        Ok(())
    }

    /// Current per-level budget
    pub fn levels(&self) -> &[i64] {
        &self.budget
    }

    /// Per-level values restored by [`IoTimeBudget::reset`]
    pub fn initial_levels(&self) -> &[i64] {
        &self.initial
    }

    /// Number of priority levels
    pub fn num_levels(&self) -> usize {
        self.budget.len()
    }
}

/// Clamp `levels[from..]` so no level exceeds its predecessor
fn clamp_monotonic(levels: &mut [i64], from: usize) {
    for i in from.max(1)..levels.len() {
        if levels[i] > levels[i - 1] {
            levels[i] = levels[i - 1];
        }
    }
}
