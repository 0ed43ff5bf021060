//! Random market walk that drives the paper venue during a dry run.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rust_decimal::Decimal;
use rust_decimal::prelude::*;

/// One step of the walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketStep {
    pub active_index: i32,
    pub price: Decimal,
    /// Price change since the walk started, in percent.
    pub price_change_pct: Decimal,
    /// Net P&L of a position half exposed to the price move, in percent.
    pub net_pnl_pct: Decimal,
}

pub struct MarketWalk {
    rng: StdRng,
    normal: Normal<f64>,
    start_index: i32,
    start_price: Decimal,
    bin_factor: f64,
    index: i32,
}

impl MarketWalk {
    /// `volatility_bins` is the standard deviation of the per-step move.
    pub fn new(
        start_index: i32,
        start_price: Decimal,
        bin_step_bps: u16,
        volatility_bins: f64,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            rng,
            normal: Normal::new(0.0, volatility_bins.max(0.0))?,
            start_index,
            start_price,
            bin_factor: 1.0 + f64::from(bin_step_bps) / 10_000.0,
            index: start_index,
        })
    }

    pub fn step(&mut self) -> MarketStep {
        let delta = self.normal.sample(&mut self.rng).round() as i32;
        self.index += delta;

        let moved = self.index - self.start_index;
        let factor = Decimal::from_f64(self.bin_factor.powi(moved)).unwrap_or(Decimal::ONE);
        let price = (self.start_price * factor).round_dp(6);

        let price_change_pct = if self.start_price.is_zero() {
            Decimal::ZERO
        } else {
            ((price / self.start_price - Decimal::ONE) * Decimal::ONE_HUNDRED).round_dp(2)
        };

        MarketStep {
            active_index: self.index,
            price,
            price_change_pct,
            net_pnl_pct: (price_change_pct / Decimal::TWO).round_dp(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_seeded_walk_is_reproducible() {
        let mut a = MarketWalk::new(0, dec!(1), 25, 3.0, Some(7)).unwrap();
        let mut b = MarketWalk::new(0, dec!(1), 25, 3.0, Some(7)).unwrap();
        for _ in 0..20 {
            assert_eq!(a.step(), b.step());
        }
    }

    #[test]
    fn test_zero_volatility_stands_still() {
        let mut walk = MarketWalk::new(15, dec!(2), 25, 0.0, Some(1)).unwrap();
        let step = walk.step();
        assert_eq!(step.active_index, 15);
        assert_eq!(step.price, dec!(2));
        assert_eq!(step.price_change_pct, Decimal::ZERO);
        assert_eq!(step.net_pnl_pct, Decimal::ZERO);
    }
}
