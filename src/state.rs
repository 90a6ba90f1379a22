//! Bit-vector encoding of relative cache line distances.

use serde::Serialize;
use std::fmt;

/// Bit index encoding distance 0. Distances are stored as `ZERO_OFFSET + d`,
/// so negative distances stay representable in an unsigned mask.
pub const ZERO_OFFSET: i32 = 16;

/// Plausibility bounds for a relative cache line distance, in cache lines.
///
/// These are calibration values for the observed table layout and cache line
/// size: a distance outside this interval cannot correspond to an adjacent
/// line leak within the lookup table's footprint and is dropped as noise.
pub const MIN_PLAUSIBLE_DISTANCE: i32 = -9;
pub const MAX_PLAUSIBLE_DISTANCE: i32 = 12;

/// Set of relative cache line distances between an anchor lookup and its
/// dependent lookups, packed into a 32-bit mask.
///
/// Bit `16 + d` is set if distance `d` is plausible. Bit 16 (distance 0) is
/// always set by [`StateBitvector::from_distances`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StateBitvector(u32);

impl StateBitvector {
    /// Wraps a raw mask as observed in a trace log.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Encodes a set of distances, plus the mandatory distance 0.
    ///
    /// Distances outside [`MIN_PLAUSIBLE_DISTANCE`, `MAX_PLAUSIBLE_DISTANCE`]
    /// are dropped; duplicates collapse into the same bit.
    pub fn from_distances(distances: impl IntoIterator<Item = i32>) -> Self {
        let mut mask = 1u32 << ZERO_OFFSET;
        for distance in distances {
            if (MIN_PLAUSIBLE_DISTANCE..=MAX_PLAUSIBLE_DISTANCE).contains(&distance) {
                mask |= 1 << (ZERO_OFFSET + distance);
            }
        }
        Self(mask)
    }

    /// Returns the raw 32-bit mask.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Decodes the mask back into a sorted list of signed distances.
    pub fn distances(&self) -> Vec<i32> {
        (0..u32::BITS as i32)
            .filter(|shift| self.0 & (1 << shift) != 0)
            .map(|shift| shift - ZERO_OFFSET)
            .collect()
    }

    /// Number of distances encoded in the mask.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Display for StateBitvector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032b}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_always_set() {
        assert_eq!(StateBitvector::from_distances([]).raw(), 1 << 16);
        assert_ne!(StateBitvector::from_distances([5, -3]).raw() & (1 << 16), 0);
    }

    #[test]
    fn test_round_trip() {
        let bitvector = StateBitvector::from_distances([7, -2, 0, 7, -2]);
        assert_eq!(bitvector.distances(), vec![-2, 0, 7]);
        assert_eq!(bitvector.count(), 3);
    }

    #[test]
    fn test_plausibility_filter() {
        let bitvector = StateBitvector::from_distances([-10, -9, 12, 13]);
        assert_eq!(bitvector.distances(), vec![-9, 0, 12]);
    }

    #[test]
    fn test_display_binary() {
        let bitvector = StateBitvector::from_distances([1]);
        assert_eq!(format!("{bitvector}"), "00000000000000110000000000000000");
    }
}
