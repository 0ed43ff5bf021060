//! Stop-loss decision module.
//!
//! Scores the risk of a snapshot and turns it into a verdict. A score above
//! the warning level opens an observation window for the instance; staying
//! elevated for the whole window escalates to an exit, dropping back below
//! the warning level closes it. A critical score exits immediately.

use lp_keeper_domain::{InstanceId, MarketSnapshot, Urgency};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

const LOSS_WEIGHT: Decimal = Decimal::from_parts(60, 0, 0, false, 0);
const TREND_WEIGHT: Decimal = Decimal::from_parts(25, 0, 0, false, 0);
const OUT_OF_RANGE_WEIGHT: Decimal = Decimal::from_parts(15, 0, 0, false, 0);
const YIELD_OFFSET_WEIGHT: Decimal = Decimal::from_parts(15, 0, 0, false, 0);

/// Configuration for the stop-loss module.
#[derive(Debug, Clone)]
pub struct StopLossConfig {
    /// Loss, in percent, at which the loss component saturates.
    pub max_loss_pct: Decimal,
    /// Historical price drop, in percent, at which the trend component saturates.
    pub trend_drop_pct: Decimal,
    /// Risk that opens an observation window.
    pub warning_risk: Decimal,
    /// Risk that turns an elapsed window into a full exit.
    pub exit_risk: Decimal,
    /// Risk that exits without waiting for a window.
    pub critical_risk: Decimal,
    /// How long risk must stay elevated before escalating.
    pub observation_window: Duration,
    /// Cap on concurrently tracked windows.
    pub max_tracked_windows: usize,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            max_loss_pct: Decimal::new(10, 0),
            trend_drop_pct: Decimal::new(10, 0),
            warning_risk: Decimal::new(50, 0),
            exit_risk: Decimal::new(70, 0),
            critical_risk: Decimal::new(85, 0),
            observation_window: Duration::from_secs(300), // 5 minutes
            max_tracked_windows: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLossAction {
    Hold,
    Alert,
    PartialExit,
    FullExit,
}

impl fmt::Display for StopLossAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopLossAction::Hold => "HOLD",
            StopLossAction::Alert => "ALERT",
            StopLossAction::PartialExit => "PARTIAL_EXIT",
            StopLossAction::FullExit => "FULL_EXIT",
        };
        f.write_str(s)
    }
}

/// Components that add up to the risk score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskBreakdown {
    pub loss: Decimal,
    pub trend: Decimal,
    pub out_of_range: Decimal,
    /// Subtracted from the total.
    pub yield_offset: Decimal,
}

impl RiskBreakdown {
    /// Total score, clamped to [0, 100].
    pub fn score(&self) -> Decimal {
        (self.loss + self.trend + self.out_of_range - self.yield_offset)
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossDecision {
    pub action: StopLossAction,
    /// Confidence in [0, 100].
    pub confidence: Decimal,
    /// Risk score in [0, 100].
    pub risk_score: Decimal,
    pub urgency: Urgency,
    pub reasoning: String,
    pub breakdown: RiskBreakdown,
}

#[derive(Debug, Clone, Copy)]
struct ObservationWindow {
    opened_at: Instant,
    peak_risk: Decimal,
}

/// Evaluates snapshots against per-instance observation windows.
pub struct StopLossDecisionModule {
    config: StopLossConfig,
    windows: RwLock<HashMap<InstanceId, ObservationWindow>>,
}

impl StopLossDecisionModule {
    pub fn new(config: StopLossConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StopLossConfig {
        &self.config
    }

    /// Scores a snapshot without touching any window.
    pub fn assess(&self, snapshot: &MarketSnapshot) -> RiskBreakdown {
        let mut breakdown = RiskBreakdown::default();

        if snapshot.net_pnl_pct < Decimal::ZERO && self.config.max_loss_pct > Decimal::ZERO {
            let loss_pct = -snapshot.net_pnl_pct;
            breakdown.loss = (loss_pct / self.config.max_loss_pct * LOSS_WEIGHT).min(LOSS_WEIGHT);
        }

        if let Some(change) = snapshot.price_change_pct
            && change < Decimal::ZERO
            && self.config.trend_drop_pct > Decimal::ZERO
        {
            breakdown.trend = (-change / self.config.trend_drop_pct * TREND_WEIGHT).min(TREND_WEIGHT);
        }

        if snapshot.position_bounds.is_some() && !snapshot.is_in_range() {
            breakdown.out_of_range = OUT_OF_RANGE_WEIGHT;
        }

        let total_yield = snapshot.total_yield();
        if snapshot.net_pnl < Decimal::ZERO && total_yield > Decimal::ZERO {
            let coverage = (total_yield / -snapshot.net_pnl).min(Decimal::ONE);
            breakdown.yield_offset = coverage * YIELD_OFFSET_WEIGHT;
        }

        breakdown
    }

    /// Evaluates `snapshot` for `instance` at the current time.
    pub async fn evaluate(&self, instance: &InstanceId, snapshot: &MarketSnapshot) -> StopLossDecision {
        self.evaluate_at(instance, snapshot, Instant::now()).await
    }

    pub async fn evaluate_at(
        &self,
        instance: &InstanceId,
        snapshot: &MarketSnapshot,
        now: Instant,
    ) -> StopLossDecision {
        if snapshot.simplified {
            return StopLossDecision {
                action: StopLossAction::Hold,
                confidence: Decimal::ZERO,
                risk_score: Decimal::ZERO,
                urgency: Urgency::Low,
                reasoning: "Simplified snapshot during yield extraction, no risk data".to_string(),
                breakdown: RiskBreakdown::default(),
            };
        }

        let breakdown = self.assess(snapshot);
        let risk = breakdown.score();

        let (action, reasoning) = if risk >= self.config.critical_risk {
            self.windows.write().await.remove(instance);
            (
                StopLossAction::FullExit,
                format!("Risk {risk} at or above critical level {}", self.config.critical_risk),
            )
        } else if risk >= self.config.warning_risk {
            self.observe(instance, risk, now).await
        } else {
            if self.windows.write().await.remove(instance).is_some() {
                info!(instance = %instance, risk = %risk, "Risk subsided, observation window closed");
            }
            (StopLossAction::Hold, format!("Risk {risk} below warning level"))
        };

        let mut confidence = match action {
            StopLossAction::Hold => Decimal::ONE_HUNDRED - risk,
            _ => risk,
        };
        if snapshot.price_change_pct.is_none() {
            confidence *= Decimal::new(8, 1);
        }

        StopLossDecision {
            action,
            confidence: confidence.round_dp(2),
            risk_score: risk.round_dp(2),
            urgency: urgency_for(risk),
            reasoning,
            breakdown,
        }
    }

    async fn observe(
        &self,
        instance: &InstanceId,
        risk: Decimal,
        now: Instant,
    ) -> (StopLossAction, String) {
        let mut windows = self.windows.write().await;

        if let Some(window) = windows.get_mut(instance) {
            window.peak_risk = window.peak_risk.max(risk);
            let elapsed = now.saturating_duration_since(window.opened_at);
            if elapsed < self.config.observation_window {
                return (
                    StopLossAction::Alert,
                    format!(
                        "Risk {risk} elevated for {}s of {}s observation window",
                        elapsed.as_secs(),
                        self.config.observation_window.as_secs()
                    ),
                );
            }

            let peak = window.peak_risk;
            windows.remove(instance);
            return if risk >= self.config.exit_risk {
                (
                    StopLossAction::FullExit,
                    format!("Risk {risk} stayed elevated through the observation window (peak {peak})"),
                )
            } else {
                (
                    StopLossAction::PartialExit,
                    format!("Risk {risk} stayed elevated but below exit level {}", self.config.exit_risk),
                )
            };
        }

        if windows.len() >= self.config.max_tracked_windows
            && let Some(oldest) = windows
                .iter()
                .min_by_key(|(_, window)| window.opened_at)
                .map(|(id, _)| id.clone())
        {
            warn!(evicted = %oldest, "Observation window cap reached, evicting oldest");
            windows.remove(&oldest);
        }
        windows.insert(
            instance.clone(),
            ObservationWindow {
                opened_at: now,
                peak_risk: risk,
            },
        );
        info!(instance = %instance, risk = %risk, "Observation window opened");
        (
            StopLossAction::Alert,
            format!("Risk {risk} crossed warning level {}", self.config.warning_risk),
        )
    }

    /// Drops the observation window of `instance`.
    pub async fn purge(&self, instance: &InstanceId) -> bool {
        self.windows.write().await.remove(instance).is_some()
    }

    pub async fn purge_all(&self) -> usize {
        let mut windows = self.windows.write().await;
        let count = windows.len();
        windows.clear();
        count
    }

    pub async fn window_count(&self) -> usize {
        self.windows.read().await.len()
    }

    pub async fn has_window(&self, instance: &InstanceId) -> bool {
        self.windows.read().await.contains_key(instance)
    }
}

fn urgency_for(risk: Decimal) -> Urgency {
    if risk >= Decimal::new(80, 0) {
        Urgency::High
    } else if risk >= Decimal::new(50, 0) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lp_keeper_domain::BinRange;
    use rust_decimal_macros::dec;

    fn snapshot(net_pnl_pct: Decimal, price_change_pct: Option<Decimal>, active: i32) -> MarketSnapshot {
        let mut snapshot =
            MarketSnapshot::simplified(dec!(1), active, Some(BinRange::new(10, 20).unwrap()));
        snapshot.simplified = false;
        snapshot.net_pnl_pct = net_pnl_pct;
        snapshot.net_pnl = dec!(100) * net_pnl_pct / dec!(100);
        snapshot.price_change_pct = price_change_pct;
        snapshot
    }

    fn module() -> StopLossDecisionModule {
        StopLossDecisionModule::new(StopLossConfig::default())
    }

    #[tokio::test]
    async fn test_critical_risk_exits_immediately() {
        let module = module();
        let id = InstanceId::from("i-1");
        let decision = module
            .evaluate(&id, &snapshot(dec!(-30), Some(dec!(-20)), 15))
            .await;

        assert_eq!(decision.action, StopLossAction::FullExit);
        assert_eq!(decision.risk_score, dec!(85));
        assert_eq!(decision.urgency, Urgency::High);
        assert_eq!(module.window_count().await, 0);
    }

    #[tokio::test]
    async fn test_healthy_position_holds() {
        let module = module();
        let decision = module
            .evaluate(&InstanceId::from("i-1"), &snapshot(dec!(2), Some(dec!(1)), 15))
            .await;
        assert_eq!(decision.action, StopLossAction::Hold);
        assert_eq!(decision.risk_score, Decimal::ZERO);
        assert_eq!(decision.confidence, dec!(100));
        assert_eq!(decision.urgency, Urgency::Low);
    }

    #[tokio::test]
    async fn test_window_escalates_to_full_exit() {
        let module = module();
        let id = InstanceId::from("i-1");
        let start = Instant::now();
        // loss 60 + out of range 15 = 75
        let elevated = snapshot(dec!(-10), Some(Decimal::ZERO), 30);

        let first = module.evaluate_at(&id, &elevated, start).await;
        assert_eq!(first.action, StopLossAction::Alert);
        assert_eq!(first.urgency, Urgency::Medium);
        assert!(module.has_window(&id).await);

        let waiting = module
            .evaluate_at(&id, &elevated, start + Duration::from_secs(60))
            .await;
        assert_eq!(waiting.action, StopLossAction::Alert);

        let exit = module
            .evaluate_at(&id, &elevated, start + Duration::from_secs(301))
            .await;
        assert_eq!(exit.action, StopLossAction::FullExit);
        assert!(!module.has_window(&id).await);
    }

    #[tokio::test]
    async fn test_window_below_exit_risk_is_partial() {
        let module = module();
        let id = InstanceId::from("i-1");
        let start = Instant::now();
        // loss 60 only
        let elevated = snapshot(dec!(-10), Some(Decimal::ZERO), 15);

        module.evaluate_at(&id, &elevated, start).await;
        let decision = module
            .evaluate_at(&id, &elevated, start + Duration::from_secs(300))
            .await;
        assert_eq!(decision.action, StopLossAction::PartialExit);
    }

    #[tokio::test]
    async fn test_subsiding_risk_closes_window() {
        let module = module();
        let id = InstanceId::from("i-1");
        module
            .evaluate(&id, &snapshot(dec!(-10), Some(Decimal::ZERO), 15))
            .await;
        assert_eq!(module.window_count().await, 1);

        let decision = module
            .evaluate(&id, &snapshot(dec!(-1), Some(Decimal::ZERO), 15))
            .await;
        assert_eq!(decision.action, StopLossAction::Hold);
        assert_eq!(module.window_count().await, 0);
    }

    #[tokio::test]
    async fn test_simplified_snapshot_holds() {
        let module = module();
        let mut snap = snapshot(dec!(-50), Some(dec!(-50)), 40);
        snap.simplified = true;
        let decision = module.evaluate(&InstanceId::from("i-1"), &snap).await;
        assert_eq!(decision.action, StopLossAction::Hold);
        assert_eq!(module.window_count().await, 0);
    }

    #[tokio::test]
    async fn test_yield_offsets_risk_and_missing_history_lowers_confidence() {
        let module = module();
        let mut snap = snapshot(dec!(-10), None, 15);
        snap.pending_yield = dec!(10);
        let breakdown = module.assess(&snap);
        assert_eq!(breakdown.loss, dec!(60));
        assert_eq!(breakdown.yield_offset, dec!(15));
        assert_eq!(breakdown.score(), dec!(45));

        let decision = module.evaluate(&InstanceId::from("i-1"), &snap).await;
        assert_eq!(decision.confidence, dec!(44));
    }

    #[tokio::test]
    async fn test_window_cap_evicts_oldest() {
        let module = StopLossDecisionModule::new(StopLossConfig {
            max_tracked_windows: 2,
            ..Default::default()
        });
        let elevated = snapshot(dec!(-10), Some(Decimal::ZERO), 15);
        let start = Instant::now();

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            module
                .evaluate_at(
                    &InstanceId::from(*id),
                    &elevated,
                    start + Duration::from_secs(i as u64),
                )
                .await;
        }

        assert_eq!(module.window_count().await, 2);
        assert!(!module.has_window(&InstanceId::from("a")).await);
        assert_eq!(module.purge_all().await, 2);
    }
}
