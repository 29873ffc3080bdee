//! Allocation metadata: a contiguous run of units at one granularity level.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A run of `size` units at `level`, starting at `start`.
///
/// `start` is always expressed in level-0 units, so a run keeps its address
/// when converted between levels. One unit at level `L + 1` covers exactly
/// two units at level `L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationMetadata {
    pub start: u64,
    pub size: u64,
    pub level: usize,
}

/// `units * 2^shift`, saturating at `u64::MAX`.
#[inline]
pub fn scale_units(units: u64, shift: usize) -> u64 {
    u32::try_from(shift)
        .ok()
        .and_then(|shift| 1u64.checked_shl(shift))
        .map_or(if units == 0 { 0 } else { u64::MAX }, |factor| {
            units.saturating_mul(factor)
        })
}

impl AllocationMetadata {
    pub fn new(start: u64, size: u64, level: usize) -> Self {
        Self { start, size, level }
    }

    /// Number of level-0 units covered by this run.
    #[inline]
    pub fn size_at_level0(&self) -> u64 {
        scale_units(self.size, self.level)
    }

    /// First level-0 address past the end of this run.
    #[inline]
    pub fn limit(&self) -> u64 {
        self.start.saturating_add(self.size_at_level0())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Split off the first `amount` units, leaving the remainder in `self`.
    pub fn take(&mut self, amount: u64) -> AllocationMetadata {
        debug_assert!(amount <= self.size);
        let amount = amount.min(self.size);

        let prefix = AllocationMetadata::new(self.start, amount, self.level);
        self.start = self.start.saturating_add(scale_units(amount, self.level));
        self.size -= amount;
        prefix
    }

    /// Re-express this run at a finer level. Sizes scale by `2^(level - lower)`.
    pub fn as_level(&self, lower: usize) -> AllocationMetadata {
        debug_assert!(lower <= self.level);
        let shift = self.level.saturating_sub(lower);
        AllocationMetadata::new(self.start, scale_units(self.size, shift), lower)
    }

    pub fn joinable_with(&self, other: &AllocationMetadata) -> bool {
        self.level == other.level && other.start == self.limit()
    }

    pub fn join(&mut self, other: &AllocationMetadata) {
        debug_assert!(self.joinable_with(other));
        self.size += other.size;
    }
}

impl fmt::Display for AllocationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.start, self.size, self.level)
    }
}
