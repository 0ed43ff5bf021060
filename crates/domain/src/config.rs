//! Strategy configuration.
//!
//! A [`StrategyConfig`] is fixed for as long as an instance runs; it can only be
//! changed through a [`StrategyConfigPatch`] while the instance is stopped.

use crate::error::{DomainError, DomainResult};
use crate::value_objects::PriceBand;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a price-band violation does to a recreation attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceGuardMode {
    /// Checked by the recreation module before anything is closed; the
    /// position is kept as is.
    KeepPosition,
    /// Checked after the closes succeed; the strategy halts instead of reopening.
    #[default]
    HaltStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceGuard {
    #[serde(flatten)]
    pub band: PriceBand,
    #[serde(default)]
    pub mode: PriceGuardMode,
}

impl PriceGuard {
    pub fn keep_position(band: PriceBand) -> Self {
        Self {
            band,
            mode: PriceGuardMode::KeepPosition,
        }
    }

    pub fn halt_strategy(band: PriceBand) -> Self {
        Self {
            band,
            mode: PriceGuardMode::HaltStrategy,
        }
    }

    pub fn applies_to(&self, mode: PriceGuardMode) -> bool {
        self.mode == mode && self.band.is_configured()
    }
}

/// Dynamic recreation switch: recreation is only allowed while the rolling
/// benchmark yield stays at or above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicYieldConfig {
    /// Benchmark yield threshold, in percent.
    pub benchmark_threshold_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOpportunityConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Distance from either range edge, as a fraction of the range, that
    /// counts as "near the edge".
    #[serde(default = "default_edge_fraction")]
    pub edge_fraction: Decimal,
    /// Minimum net P&L, in percent.
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: Decimal,
}

impl Default for MarketOpportunityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            edge_fraction: default_edge_fraction(),
            min_profit_pct: default_min_profit_pct(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossRecoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Net P&L percent at or below which the loss is marked.
    #[serde(default = "default_mark_below_pct")]
    pub mark_below_pct: Decimal,
    /// Net P&L percent a marked position has to recover to.
    #[serde(default = "default_recover_above_pct")]
    pub recover_above_pct: Decimal,
}

impl Default for LossRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mark_below_pct: default_mark_below_pct(),
            recover_above_pct: default_recover_above_pct(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecreationToggles {
    #[serde(default = "default_true")]
    pub timeout_exit: bool,
    #[serde(default)]
    pub market_opportunity: MarketOpportunityConfig,
    #[serde(default)]
    pub loss_recovery: LossRecoveryConfig,
}

impl Default for RecreationToggles {
    fn default() -> Self {
        Self {
            timeout_exit: true,
            market_opportunity: MarketOpportunityConfig::default(),
            loss_recovery: LossRecoveryConfig::default(),
        }
    }
}

/// Parameters of one strategy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Pool identifier.
    pub pool: String,
    /// Position size, in human units of the quote token (side B).
    pub position_amount: Decimal,
    /// Width of the range in bins; the range holds `width + 1` bins.
    #[serde(default = "default_range_width")]
    pub range_width_bins: u32,
    /// Above this many bins the range is split across two positions.
    #[serde(default = "default_max_bins_per_position")]
    pub max_bins_per_position: u32,
    /// Seconds between monitoring ticks.
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Seconds out of range before a timeout recreation.
    #[serde(default = "default_out_of_range_timeout_secs")]
    pub out_of_range_timeout_secs: u64,
    /// Price band checked before reopening positions.
    #[serde(default)]
    pub price_guard: PriceGuard,
    /// Benchmark-yield gate on recreation; off when absent.
    #[serde(default)]
    pub dynamic_yield: Option<DynamicYieldConfig>,
    /// Which recreation triggers are enabled.
    #[serde(default)]
    pub recreation: RecreationToggles,
    /// Run the stop-loss evaluation while monitoring.
    #[serde(default = "default_true")]
    pub smart_stop_loss: bool,
    /// Stop-loss evaluation cadence, in ticks.
    #[serde(default = "default_stop_loss_every_n_ticks")]
    pub stop_loss_every_n_ticks: u32,
    /// Slippage for the residual swap before a recreation, in basis points.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Slippage for the residual swap after a stop-loss exit.
    #[serde(default = "default_stop_loss_slippage_bps")]
    pub stop_loss_slippage_bps: u16,
}

fn default_true() -> bool {
    true
}

fn default_edge_fraction() -> Decimal {
    Decimal::new(15, 2) // 15% of the range
}

fn default_min_profit_pct() -> Decimal {
    Decimal::ONE
}

fn default_mark_below_pct() -> Decimal {
    Decimal::new(-5, 0)
}

fn default_recover_above_pct() -> Decimal {
    Decimal::new(-1, 0)
}

const fn default_range_width() -> u32 {
    60
}

const fn default_max_bins_per_position() -> u32 {
    69
}

const fn default_monitoring_interval_secs() -> u64 {
    60
}

const fn default_out_of_range_timeout_secs() -> u64 {
    600 // 10 minutes
}

const fn default_stop_loss_every_n_ticks() -> u32 {
    1
}

const fn default_slippage_bps() -> u16 {
    100 // 1%
}

const fn default_stop_loss_slippage_bps() -> u16 {
    300 // 3%
}

impl StrategyConfig {
    /// Creates a config with every optional field at its default.
    pub fn new(pool: impl Into<String>, position_amount: Decimal) -> Self {
        Self {
            pool: pool.into(),
            position_amount,
            range_width_bins: default_range_width(),
            max_bins_per_position: default_max_bins_per_position(),
            monitoring_interval_secs: default_monitoring_interval_secs(),
            out_of_range_timeout_secs: default_out_of_range_timeout_secs(),
            price_guard: PriceGuard::default(),
            dynamic_yield: None,
            recreation: RecreationToggles::default(),
            smart_stop_loss: true,
            stop_loss_every_n_ticks: default_stop_loss_every_n_ticks(),
            slippage_bps: default_slippage_bps(),
            stop_loss_slippage_bps: default_stop_loss_slippage_bps(),
        }
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    pub fn out_of_range_timeout(&self) -> Duration {
        Duration::from_secs(self.out_of_range_timeout_secs)
    }

    /// Validates the config.
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> DomainResult<()> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> DomainResult<()> {
            Err(DomainError::InvalidConfig {
                field,
                reason: reason.into(),
            })
        }

        if self.pool.trim().is_empty() {
            return invalid("pool", "must not be empty");
        }
        if self.position_amount <= Decimal::ZERO {
            return invalid("position_amount", "must be positive");
        }
        if self.range_width_bins == 0 {
            return invalid("range_width_bins", "must be at least 1");
        }
        if self.max_bins_per_position == 0 {
            return invalid("max_bins_per_position", "must be at least 1");
        }
        if u64::from(self.range_width_bins) + 1 > 2 * u64::from(self.max_bins_per_position) {
            return invalid(
                "range_width_bins",
                format!(
                    "{} bins do not fit in two positions of {}",
                    self.range_width_bins + 1,
                    self.max_bins_per_position
                ),
            );
        }
        if self.monitoring_interval_secs == 0 {
            return invalid("monitoring_interval_secs", "must be at least 1");
        }
        if self.stop_loss_every_n_ticks == 0 {
            return invalid("stop_loss_every_n_ticks", "must be at least 1");
        }
        if self.slippage_bps > 10_000 {
            return invalid("slippage_bps", "must not exceed 10000");
        }
        if self.stop_loss_slippage_bps > 10_000 {
            return invalid("stop_loss_slippage_bps", "must not exceed 10000");
        }

        let band = self.price_guard.band;
        if band.floor.is_some_and(|f| f <= Decimal::ZERO) {
            return invalid("price_guard.floor", "must be positive");
        }
        if let (Some(floor), Some(ceiling)) = (band.floor, band.ceiling)
            && floor >= ceiling
        {
            return invalid("price_guard", "floor must be below ceiling");
        }

        let opportunity = &self.recreation.market_opportunity;
        if opportunity.edge_fraction <= Decimal::ZERO || opportunity.edge_fraction > Decimal::new(5, 1)
        {
            return invalid(
                "recreation.market_opportunity.edge_fraction",
                "must be in (0, 0.5]",
            );
        }

        let recovery = &self.recreation.loss_recovery;
        if recovery.recover_above_pct <= recovery.mark_below_pct {
            return invalid(
                "recreation.loss_recovery",
                "recover_above_pct must be above mark_below_pct",
            );
        }

        Ok(())
    }
}

/// Partial update applied with `update_config` while an instance is stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfigPatch {
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub position_amount: Option<Decimal>,
    #[serde(default)]
    pub range_width_bins: Option<u32>,
    #[serde(default)]
    pub monitoring_interval_secs: Option<u64>,
    #[serde(default)]
    pub out_of_range_timeout_secs: Option<u64>,
    #[serde(default)]
    pub price_guard: Option<PriceGuard>,
    #[serde(default)]
    pub dynamic_yield: Option<DynamicYieldConfig>,
    /// Removes the dynamic yield switch; wins over `dynamic_yield`.
    #[serde(default)]
    pub clear_dynamic_yield: bool,
    #[serde(default)]
    pub recreation: Option<RecreationToggles>,
    #[serde(default)]
    pub smart_stop_loss: Option<bool>,
    #[serde(default)]
    pub slippage_bps: Option<u16>,
    #[serde(default)]
    pub stop_loss_slippage_bps: Option<u16>,
}

impl StrategyConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Produces the patched config, validated.
    ///
    /// # Errors
    /// Returns the validation error of the resulting config.
    pub fn apply(&self, base: &StrategyConfig) -> DomainResult<StrategyConfig> {
        let mut config = base.clone();
        if let Some(pool) = &self.pool {
            config.pool = pool.clone();
        }
        if let Some(amount) = self.position_amount {
            config.position_amount = amount;
        }
        if let Some(width) = self.range_width_bins {
            config.range_width_bins = width;
        }
        if let Some(interval) = self.monitoring_interval_secs {
            config.monitoring_interval_secs = interval;
        }
        if let Some(timeout) = self.out_of_range_timeout_secs {
            config.out_of_range_timeout_secs = timeout;
        }
        if let Some(guard) = self.price_guard {
            config.price_guard = guard;
        }
        if self.clear_dynamic_yield {
            config.dynamic_yield = None;
        } else if let Some(dynamic) = self.dynamic_yield {
            config.dynamic_yield = Some(dynamic);
        }
        if let Some(recreation) = self.recreation {
            config.recreation = recreation;
        }
        if let Some(enabled) = self.smart_stop_loss {
            config.smart_stop_loss = enabled;
        }
        if let Some(bps) = self.slippage_bps {
            config.slippage_bps = bps;
        }
        if let Some(bps) = self.stop_loss_slippage_bps {
            config.stop_loss_slippage_bps = bps;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        let config = StrategyConfig::new("pool-1", dec!(100));
        assert!(config.validate().is_ok());
        assert_eq!(config.monitoring_interval(), Duration::from_secs(60));
        assert_eq!(config.price_guard.mode, PriceGuardMode::HaltStrategy);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let config: StrategyConfig =
            serde_json::from_str(r#"{"pool":"pool-1","position_amount":"250"}"#).unwrap();
        assert_eq!(config.position_amount, dec!(250));
        assert_eq!(config.range_width_bins, 60);
        assert!(config.recreation.timeout_exit);
        assert!(config.smart_stop_loss);
    }

    #[test]
    fn test_deserialize_price_guard() {
        let config: StrategyConfig = serde_json::from_str(
            r#"{"pool":"p","position_amount":"1","price_guard":{"floor":"0.5","mode":"keep_position"}}"#,
        )
        .unwrap();
        assert_eq!(config.price_guard.band.floor, Some(dec!(0.5)));
        assert_eq!(config.price_guard.mode, PriceGuardMode::KeepPosition);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = StrategyConfig::new("", dec!(1));
        assert!(matches!(
            config.validate(),
            Err(DomainError::InvalidConfig { field: "pool", .. })
        ));

        config.pool = "p".to_string();
        config.range_width_bins = 200;
        assert!(config.validate().is_err());

        config.range_width_bins = 10;
        config.price_guard = PriceGuard::halt_strategy(PriceBand::new(Some(dec!(2)), Some(dec!(1))));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patch_apply() {
        let base = StrategyConfig::new("p", dec!(1));
        let patch = StrategyConfigPatch {
            range_width_bins: Some(20),
            dynamic_yield: Some(DynamicYieldConfig {
                benchmark_threshold_pct: dec!(0.5),
            }),
            ..Default::default()
        };
        let patched = patch.apply(&base).unwrap();
        assert_eq!(patched.range_width_bins, 20);
        assert!(patched.dynamic_yield.is_some());

        let clear = StrategyConfigPatch {
            clear_dynamic_yield: true,
            ..Default::default()
        };
        assert!(clear.apply(&patched).unwrap().dynamic_yield.is_none());
    }

    #[test]
    fn test_patch_apply_validates() {
        let base = StrategyConfig::new("p", dec!(1));
        let patch = StrategyConfigPatch {
            position_amount: Some(dec!(-3)),
            ..Default::default()
        };
        assert!(patch.apply(&base).is_err());
        assert!(StrategyConfigPatch::default().is_empty());
    }
}
