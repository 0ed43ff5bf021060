use crate::enums::RangeDirection;
use crate::error::{DomainError, DomainResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive `[lower, upper]` interval of active-bin indices covered by a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinRange {
    pub lower: i32,
    pub upper: i32,
}

impl BinRange {
    pub fn new(lower: i32, upper: i32) -> DomainResult<Self> {
        if lower > upper {
            return Err(DomainError::InvalidRange { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// Range spanning `width` bins past `lower`, roughly centered on the
    /// active bin: `lower = active - width / 2`, `upper = lower + width`.
    #[must_use]
    pub fn centered(active: i32, width: u32) -> Self {
        let width = i32::try_from(width).unwrap_or(i32::MAX / 2);
        let lower = active.saturating_sub(width / 2);
        Self {
            lower,
            upper: lower.saturating_add(width),
        }
    }

    pub fn contains(&self, index: i32) -> bool {
        index >= self.lower && index <= self.upper
    }

    /// Which side of the range `index` sits on, or `None` when inside.
    pub fn direction_of(&self, index: i32) -> Option<RangeDirection> {
        if index > self.upper {
            Some(RangeDirection::Above)
        } else if index < self.lower {
            Some(RangeDirection::Below)
        } else {
            None
        }
    }

    pub fn bin_count(&self) -> u32 {
        self.upper.abs_diff(self.lower) + 1
    }

    /// Position of `index` inside the range: 0 at the lower edge, 1 at the upper
    /// edge, clamped outside.
    pub fn relative_position(&self, index: i32) -> Decimal {
        if self.upper == self.lower {
            return Decimal::new(5, 1);
        }
        let span = Decimal::from(i64::from(self.upper) - i64::from(self.lower));
        let offset = Decimal::from(i64::from(index) - i64::from(self.lower));
        (offset / span).clamp(Decimal::ZERO, Decimal::ONE)
    }

    /// Splits the range into at most two contiguous halves when it holds more
    /// bins than a single position may cover.
    pub fn split(&self, max_bins_per_position: u32) -> Vec<BinRange> {
        let bins = self.bin_count();
        if max_bins_per_position == 0 || bins <= max_bins_per_position {
            return vec![*self];
        }
        let first_len = bins.div_ceil(2);
        let first_upper = self.lower + (first_len as i32) - 1;
        vec![
            BinRange {
                lower: self.lower,
                upper: first_upper,
            },
            BinRange {
                lower: first_upper + 1,
                upper: self.upper,
            },
        ]
    }

    /// Smallest range covering every input range.
    pub fn union(ranges: &[BinRange]) -> Option<BinRange> {
        let lower = ranges.iter().map(|r| r.lower).min()?;
        let upper = ranges.iter().map(|r| r.upper).max()?;
        Some(BinRange { lower, upper })
    }
}

impl fmt::Display for BinRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_rejects_inverted_bounds() {
        assert!(BinRange::new(5, 4).is_err());
        assert!(BinRange::new(4, 4).is_ok());
    }

    #[test]
    fn test_centered_range() {
        let range = BinRange::centered(15, 10);
        assert_eq!(range, BinRange { lower: 10, upper: 20 });

        let range = BinRange::centered(25, 10);
        assert_eq!(range, BinRange { lower: 20, upper: 30 });
    }

    #[test]
    fn test_contains_is_inclusive() {
        let range = BinRange::new(10, 20).unwrap();
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert_eq!(range.direction_of(25), Some(RangeDirection::Above));
        assert_eq!(range.direction_of(9), Some(RangeDirection::Below));
        assert_eq!(range.direction_of(15), None);
    }

    #[test]
    fn test_split_into_two_positions() {
        let range = BinRange::new(10, 20).unwrap();
        let parts = range.split(6);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], BinRange { lower: 10, upper: 15 });
        assert_eq!(parts[1], BinRange { lower: 16, upper: 20 });
        assert_eq!(BinRange::union(&parts), Some(range));

        assert_eq!(range.split(69), vec![range]);
    }

    #[test]
    fn test_relative_position() {
        let range = BinRange::new(0, 10).unwrap();
        assert_eq!(range.relative_position(0), Decimal::ZERO);
        assert_eq!(range.relative_position(5), dec!(0.5));
        assert_eq!(range.relative_position(50), Decimal::ONE);
    }
}
