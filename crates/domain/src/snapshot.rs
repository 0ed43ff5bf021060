//! Market snapshot taken once per monitoring cycle.

use crate::value_objects::BinRange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Everything the decision modules look at, captured in one consistent read.
///
/// Snapshots are immutable once built; a new cycle produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Pool price of token A in token B.
    pub price: Decimal,
    /// Current value of all positions, in token B.
    pub position_value: Decimal,
    /// Net P&L in token B (value + yield - deposited).
    pub net_pnl: Decimal,
    /// Net P&L in percent of the deposited amount.
    pub net_pnl_pct: Decimal,
    pub active_index: i32,
    pub position_bounds: Option<BinRange>,
    pub holding_secs: u64,
    pub pending_yield: Decimal,
    pub extracted_yield: Decimal,
    /// Price change over the analytics lookback window, in percent.
    pub price_change_pct: Option<Decimal>,
    /// Yield rate over the analytics lookback window, in percent per hour.
    pub yield_rate_pct: Option<Decimal>,
    /// Rolling benchmark yield used by the dynamic recreation switch, in percent.
    pub benchmark_yield_pct: Option<Decimal>,
    /// Built from cached or reduced data while a yield extraction was running.
    pub simplified: bool,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// A reduced snapshot carrying only price and range data. P&L and yield
    /// fields are zero and must not be acted upon.
    pub fn simplified(price: Decimal, active_index: i32, bounds: Option<BinRange>) -> Self {
        Self {
            price,
            position_value: Decimal::ZERO,
            net_pnl: Decimal::ZERO,
            net_pnl_pct: Decimal::ZERO,
            active_index,
            position_bounds: bounds,
            holding_secs: 0,
            pending_yield: Decimal::ZERO,
            extracted_yield: Decimal::ZERO,
            price_change_pct: None,
            yield_rate_pct: None,
            benchmark_yield_pct: None,
            simplified: true,
            captured_at: Utc::now(),
        }
    }

    pub fn is_in_range(&self) -> bool {
        self.position_bounds
            .is_some_and(|bounds| bounds.contains(self.active_index))
    }

    pub fn total_yield(&self) -> Decimal {
        self.pending_yield + self.extracted_yield
    }

    /// Marks a cached snapshot as reused while yield extraction runs.
    #[must_use]
    pub fn into_simplified(mut self) -> Self {
        self.simplified = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_simplified_snapshot() {
        let bounds = BinRange::new(10, 20).unwrap();
        let snapshot = MarketSnapshot::simplified(dec!(1.5), 12, Some(bounds));
        assert!(snapshot.simplified);
        assert!(snapshot.is_in_range());
        assert_eq!(snapshot.total_yield(), Decimal::ZERO);

        let outside = MarketSnapshot::simplified(dec!(1.5), 25, Some(bounds));
        assert!(!outside.is_in_range());
        assert!(!MarketSnapshot::simplified(dec!(1), 0, None).is_in_range());
    }
}
