//! Position recreation decision module.
//!
//! Tracks, per instance, when the active bin left the position range and in
//! which direction. Once it has been out for longer than the configured
//! timeout the position should be recreated around the new active bin. Two
//! optional heuristics can ask for recreation earlier:
//! - market opportunity: the active bin sits near an edge of the range while
//!   the position is in profit
//! - loss recovery: a position marked at a loss has recovered past a trigger
//!
//! Priority when several fire at once: loss recovery, market opportunity,
//! timeout.

use lp_keeper_domain::{
    BandViolation, InstanceId, MarketSnapshot, PriceGuardMode, RangeDirection, StrategyConfig,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Why a position should be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecreationKind {
    OutOfRange,
    MarketOpportunity,
    LossRecovery,
}

impl fmt::Display for RecreationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecreationKind::OutOfRange => "OUT_OF_RANGE",
            RecreationKind::MarketOpportunity => "MARKET_OPPORTUNITY",
            RecreationKind::LossRecovery => "LOSS_RECOVERY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreationVerdict {
    NoAction,
    /// The active bin just left the range; the timeout starts now.
    TimingStarted { direction: RangeDirection },
    Waiting {
        direction: RangeDirection,
        elapsed: Duration,
        remaining: Duration,
    },
    Recreate { kind: RecreationKind },
    /// Recreation is due but the price is outside the allowed band; keep the
    /// position as it is.
    PriceCheckFailed { violation: BandViolation },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecreationDecision {
    pub verdict: RecreationVerdict,
    /// Confidence in [0, 100].
    pub confidence: Decimal,
    pub reasoning: String,
}

impl RecreationDecision {
    fn new(verdict: RecreationVerdict, confidence: Decimal, reasoning: impl Into<String>) -> Self {
        Self {
            verdict,
            confidence,
            reasoning: reasoning.into(),
        }
    }

    pub fn should_recreate(&self) -> bool {
        matches!(self.verdict, RecreationVerdict::Recreate { .. })
    }

    pub fn kind(&self) -> Option<RecreationKind> {
        match self.verdict {
            RecreationVerdict::Recreate { kind } => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OutOfRangeTimer {
    started_at: Instant,
    direction: RangeDirection,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tracking {
    out_of_range: Option<OutOfRangeTimer>,
    /// Net P&L percent recorded when the position was marked at a loss.
    loss_mark: Option<Decimal>,
}

/// Decides when positions should be recreated.
#[derive(Default)]
pub struct RecreationDecisionModule {
    tracking: RwLock<HashMap<InstanceId, Tracking>>,
}

impl RecreationDecisionModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn evaluate(
        &self,
        instance: &InstanceId,
        config: &StrategyConfig,
        snapshot: &MarketSnapshot,
    ) -> RecreationDecision {
        self.evaluate_at(instance, config, snapshot, Instant::now())
            .await
    }

    /// Produces exactly one verdict for the snapshot.
    pub async fn evaluate_at(
        &self,
        instance: &InstanceId,
        config: &StrategyConfig,
        snapshot: &MarketSnapshot,
        now: Instant,
    ) -> RecreationDecision {
        let Some(bounds) = snapshot.position_bounds else {
            return RecreationDecision::new(
                RecreationVerdict::NoAction,
                Decimal::ZERO,
                "No position range",
            );
        };

        let mut tracking = self.tracking.write().await;
        let entry = tracking.entry(instance.clone()).or_default();

        let loss_recovery = Self::loss_recovery(entry, config, snapshot);
        let opportunity = Self::market_opportunity(config, snapshot);
        let direction = bounds.direction_of(snapshot.active_index);
        let range = Self::track_range(entry, instance, config, snapshot, direction, now);
        drop(tracking);

        let decision = loss_recovery.or(opportunity).unwrap_or(range);

        if decision.should_recreate()
            && config.price_guard.applies_to(PriceGuardMode::KeepPosition)
            && let Some(violation) = config.price_guard.band.violation(snapshot.price)
        {
            info!(instance = %instance, %violation, "Recreation due but price outside band, keeping position");
            return RecreationDecision::new(
                RecreationVerdict::PriceCheckFailed { violation },
                Decimal::ONE_HUNDRED,
                format!("PRICE_CHECK_FAILED: {violation}, keeping position"),
            );
        }

        decision
    }

    fn loss_recovery(
        entry: &mut Tracking,
        config: &StrategyConfig,
        snapshot: &MarketSnapshot,
    ) -> Option<RecreationDecision> {
        let settings = &config.recreation.loss_recovery;
        if !settings.enabled || snapshot.simplified {
            return None;
        }

        let pnl = snapshot.net_pnl_pct;
        match entry.loss_mark {
            None if pnl <= settings.mark_below_pct => {
                entry.loss_mark = Some(pnl);
                debug!(pnl = %pnl, "Position marked at a loss");
                None
            }
            Some(mark) if pnl >= settings.recover_above_pct => {
                entry.loss_mark = None;
                Some(RecreationDecision::new(
                    RecreationVerdict::Recreate {
                        kind: RecreationKind::LossRecovery,
                    },
                    Decimal::new(75, 0),
                    format!("Recovered from {mark}% to {pnl}%"),
                ))
            }
            Some(mark) => {
                entry.loss_mark = Some(mark.min(pnl));
                None
            }
            None => None,
        }
    }

    fn market_opportunity(
        config: &StrategyConfig,
        snapshot: &MarketSnapshot,
    ) -> Option<RecreationDecision> {
        let settings = &config.recreation.market_opportunity;
        if !settings.enabled || snapshot.simplified || !snapshot.is_in_range() {
            return None;
        }
        let bounds = snapshot.position_bounds?;

        let position = bounds.relative_position(snapshot.active_index);
        let near_edge =
            position <= settings.edge_fraction || position >= Decimal::ONE - settings.edge_fraction;
        if !near_edge || snapshot.net_pnl_pct < settings.min_profit_pct {
            return None;
        }

        Some(RecreationDecision::new(
            RecreationVerdict::Recreate {
                kind: RecreationKind::MarketOpportunity,
            },
            Decimal::new(60, 0),
            format!(
                "Active bin at {:.2} of range with {}% profit",
                position, snapshot.net_pnl_pct
            ),
        ))
    }

    fn track_range(
        entry: &mut Tracking,
        instance: &InstanceId,
        config: &StrategyConfig,
        snapshot: &MarketSnapshot,
        direction: Option<RangeDirection>,
        now: Instant,
    ) -> RecreationDecision {
        let Some(direction) = direction else {
            if entry.out_of_range.take().is_some() {
                info!(instance = %instance, "Back in range, out-of-range timer cleared");
            }
            return RecreationDecision::new(RecreationVerdict::NoAction, Decimal::ZERO, "In range");
        };

        let timer = match entry.out_of_range {
            Some(timer) if timer.direction == direction => timer,
            previous => {
                let timer = OutOfRangeTimer {
                    started_at: now,
                    direction,
                };
                entry.out_of_range = Some(timer);
                if previous.is_some() {
                    info!(instance = %instance, ?direction, "Out-of-range direction flipped, timer restarted");
                } else {
                    info!(instance = %instance, ?direction, active = snapshot.active_index, "Out of range, timer started");
                }
                return RecreationDecision::new(
                    RecreationVerdict::TimingStarted { direction },
                    Decimal::ZERO,
                    format!("Out of range {direction:?}, timing started"),
                );
            }
        };

        if !config.recreation.timeout_exit {
            return RecreationDecision::new(
                RecreationVerdict::NoAction,
                Decimal::ZERO,
                "Out of range, timeout exit disabled",
            );
        }

        let timeout = config.out_of_range_timeout();
        let elapsed = now.saturating_duration_since(timer.started_at);
        if elapsed >= timeout {
            return RecreationDecision::new(
                RecreationVerdict::Recreate {
                    kind: RecreationKind::OutOfRange,
                },
                Decimal::new(90, 0),
                format!("Out of range {direction:?} for {}s", elapsed.as_secs()),
            );
        }

        let progress = Decimal::from(elapsed.as_millis() as u64) * Decimal::ONE_HUNDRED
            / Decimal::from(timeout.as_millis().max(1) as u64);
        RecreationDecision::new(
            RecreationVerdict::Waiting {
                direction,
                elapsed,
                remaining: timeout - elapsed,
            },
            progress.round_dp(2),
            format!("Out of range {direction:?}, {}s remaining", (timeout - elapsed).as_secs()),
        )
    }

    /// Forgets everything tracked for `instance`.
    pub async fn reset(&self, instance: &InstanceId) -> bool {
        self.tracking.write().await.remove(instance).is_some()
    }

    pub async fn purge_all(&self) -> usize {
        let mut tracking = self.tracking.write().await;
        let count = tracking.len();
        tracking.clear();
        count
    }

    pub async fn tracked_count(&self) -> usize {
        self.tracking.read().await.len()
    }

    /// How long `instance` has been out of range, if it is.
    pub async fn out_of_range_for(&self, instance: &InstanceId) -> Option<Duration> {
        self.tracking
            .read()
            .await
            .get(instance)
            .and_then(|t| t.out_of_range)
            .map(|timer| timer.started_at.elapsed())
    }
}
