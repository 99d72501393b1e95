//! Cell addresses

use std::fmt;
use std::hash::{Hash, Hasher};

/// Radix bounds used to fold the address fields into one hash word
const MAX_LEVELS: u64 = 32;
const MAX_SETUPS: u64 = 1 << 12;
const MAX_TIMEPOINTS: u64 = 1 << 16;

/// Identifies one cell: a chunk of one resolution level of one image at one
/// timepoint.
///
/// Two addresses are equal iff all four fields match.
///
/// # Example
///
/// ```
/// use cellstream_cache::CellAddress;
///
/// let address = CellAddress::new(0, 1, 2, 42);
/// assert_eq!(address.level, 2);
/// assert_eq!(address.to_string(), "t0/s1/l2/#42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellAddress {
    /// Timepoint index
    pub timepoint: u32,

    /// Setup (view/channel) index
    pub setup: u32,

    /// Resolution level, 0 is full resolution
    pub level: u32,

    /// Linear index of the cell within its level's grid
    pub index: u64,
}

impl CellAddress {
    /// Create a new cell address
    pub const fn new(timepoint: u32, setup: u32, level: u32, index: u64) -> Self {
        Self {
            timepoint,
            setup,
            level,
            index,
        }
    }

    /// Mixed-radix combination of all four fields
    ///
    /// Fields within their radix bounds map to distinct words; larger values
    /// still hash consistently, they just may collide.
    pub fn mixed_radix(&self) -> u64 {
        self.index
            .wrapping_mul(MAX_TIMEPOINTS)
            .wrapping_add(u64::from(self.timepoint))
            .wrapping_mul(MAX_SETUPS)
            .wrapping_add(u64::from(self.setup))
            .wrapping_mul(MAX_LEVELS)
            .wrapping_add(u64::from(self.level))
    }
}

impl Hash for CellAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.mixed_radix());
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t{}/s{}/l{}/#{}",
            self.timepoint, self.setup, self.level, self.index
        )
    }
}
