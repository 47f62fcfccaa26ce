//! Hash slot ranges and slot-space coverage checks.
//!
//! The keyspace is split into 16384 hash slots following the Redis Cluster
//! specification. A topology snapshot assigns every slot to exactly one
//! master through a set of contiguous, non-overlapping ranges.

use serde::{Deserialize, Serialize};

use crate::MonitorError;

/// Total number of hash slots in the cluster (Redis Cluster standard).
pub const SLOT_COUNT: u16 = 16384;

/// A contiguous range of slots owned by one node.
///
/// # Invariants
///
/// A valid `SlotRange` always satisfies `start <= end < SLOT_COUNT`, meaning
/// it contains at least one slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16, // inclusive
}

impl SlotRange {
    /// Creates a new slot range (end is inclusive).
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or if `end >= SLOT_COUNT`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "SlotRange requires start <= end");
        assert!(end < SLOT_COUNT, "slot must be < {SLOT_COUNT}");
        Self { start, end }
    }

    /// Creates a new slot range with runtime validation.
    ///
    /// Use this for ranges reported by the cluster.
    pub fn try_new(start: u16, end: u16) -> Result<Self, MonitorError> {
        if start > end {
            return Err(MonitorError::malformed(format!(
                "slot range requires start <= end, got {start}..{end}"
            )));
        }
        if end >= SLOT_COUNT {
            return Err(MonitorError::malformed(format!(
                "slot {end} out of range (max {})",
                SLOT_COUNT - 1
            )));
        }
        Ok(Self { start, end })
    }

    /// Creates a range containing a single slot.
    pub fn single(slot: u16) -> Self {
        Self::new(slot, slot)
    }

    /// The range covering the whole keyspace.
    pub fn full() -> Self {
        Self::new(0, SLOT_COUNT - 1)
    }

    /// Returns the number of slots in this range (always >= 1 for valid ranges).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Returns true if this range contains the given slot.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns true if the two ranges share at least one slot.
    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Fraction of the keyspace covered by this range, in `(0, 1]`.
    pub fn weight(&self) -> f64 {
        f64::from(self.len()) / f64::from(SLOT_COUNT)
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Checks that `ranges` do not overlap and, when `require_full` is set,
/// that together they cover every slot exactly once.
///
/// The input order does not matter.
pub fn check_partition(ranges: &[SlotRange], require_full: bool) -> Result<(), MonitorError> {
    let mut sorted: Vec<SlotRange> = ranges.to_vec();
    sorted.sort_unstable();

    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(MonitorError::malformed(format!(
                "slot ranges {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }

    if !require_full {
        return Ok(());
    }

    let mut next: u32 = 0;
    for range in &sorted {
        if u32::from(range.start) != next {
            return Err(MonitorError::malformed(format!(
                "slots {next}-{} are not covered",
                range.start - 1
            )));
        }
        next = u32::from(range.end) + 1;
    }
    if next != u32::from(SLOT_COUNT) {
        return Err(MonitorError::malformed(format!(
            "slots {next}-{} are not covered",
            SLOT_COUNT - 1
        )));
    }
    Ok(())
}
