//! One monitoring cycle.

use super::PositionLifecycleOrchestrator;
use super::state::{FlagGuard, InstanceSlot, InstanceState};
use crate::error::ExecutionResult;
use crate::events::EventData;
use crate::recreation::RecreationVerdict;
use crate::stop_loss::StopLossAction;
use chrono::Utc;
use lp_keeper_domain::{InstanceId, MarketSnapshot, Phase, StoppingReason};
use lp_keeper_protocols::SnapshotRequest;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickBranch {
    /// Another cycle for the same instance was still running.
    Skipped,
    Paused,
    /// STOPPING for recreation: retry the recreation sequence.
    RetryRecreation,
    /// STOPPING for a stop-loss: the running exit owns the instance.
    DeferToStopLoss,
    Cleanup,
    /// CREATING without positions: retry creation.
    RetryCreation,
    Monitor,
    /// Nothing to do in the current phase.
    Idle,
}

impl TickBranch {
    fn select(state: &InstanceState, creation_in_flight: bool) -> Self {
        if state.is_paused {
            return TickBranch::Paused;
        }
        match (state.phase, state.stopping_reason) {
            (Phase::Stopping, Some(StoppingReason::PositionRecreation)) => {
                TickBranch::RetryRecreation
            }
            (Phase::Stopping, Some(StoppingReason::StopLoss | StoppingReason::ManualStop)) => {
                TickBranch::DeferToStopLoss
            }
            (Phase::Cleaning, _) => TickBranch::Cleanup,
            (Phase::Creating, _) if !state.has_been_created && !creation_in_flight => {
                TickBranch::RetryCreation
            }
            (Phase::Monitoring, _) => TickBranch::Monitor,
            _ => TickBranch::Idle,
        }
    }
}

impl PositionLifecycleOrchestrator {
    /// Runs one monitoring cycle for `id`.
    ///
    /// At most one cycle per instance runs at a time; a concurrent call
    /// returns [`TickBranch::Skipped`] without doing anything.
    ///
    /// # Errors
    /// [`crate::ExecutionError::InstanceNotFound`], or the failure of the
    /// branch that ran. Failures leave the instance in a state the next tick
    /// can pick up.
    pub async fn run_cycle(self: &Arc<Self>, id: &InstanceId) -> ExecutionResult<TickBranch> {
        let slot = self.slot(id).await?;
        let Some(_running) = FlagGuard::try_raise(&slot.tick_running) else {
            debug!(instance = %id, "Tick already in flight, skipping");
            return Ok(TickBranch::Skipped);
        };

        let branch = {
            let mut state = slot.state.lock().await;
            let branch = TickBranch::select(&state, slot.creating.load(Ordering::Acquire));
            if branch != TickBranch::Paused {
                state.tick_count += 1;
                state.last_tick = Some(Utc::now());
                state.last_tick_at = Some(Instant::now());
            }
            branch
        };
        debug!(instance = %id, ?branch, "Tick");

        match branch {
            TickBranch::RetryRecreation => {
                self.run_recreation_action(&slot, None).await?;
            }
            TickBranch::Cleanup => self.run_cleanup(&slot).await?,
            TickBranch::RetryCreation => self.run_creation(&slot).await?,
            TickBranch::Monitor => self.monitor(&slot).await?,
            TickBranch::DeferToStopLoss
            | TickBranch::Paused
            | TickBranch::Idle
            | TickBranch::Skipped => {}
        }
        Ok(branch)
    }

    async fn monitor(self: &Arc<Self>, slot: &Arc<InstanceSlot>) -> ExecutionResult<()> {
        let id = &slot.id;
        let (config, request, tick_count) = {
            let state = slot.state.lock().await;
            (
                state.config.clone(),
                SnapshotRequest {
                    pool: state.config.pool.clone(),
                    positions: state.position_addresses.clone(),
                    bounds: state.position_range,
                    deposited: state.deposited,
                    opened_at: state.opened_at,
                },
                state.tick_count,
            )
        };

        let active = self.deps.ranges.active_index(&config.pool).await?;
        slot.state.lock().await.current_active_index = Some(active);

        let collected = self
            .market_data
            .collect(id, self.next_tick_id(), &request)
            .await?;
        let snapshot = MarketSnapshot {
            active_index: active,
            position_bounds: request.bounds,
            ..collected
        };

        self.update_dynamic_switch(slot, &snapshot).await;

        let decision = self.recreation.evaluate(id, &config, &snapshot).await;
        match &decision.verdict {
            RecreationVerdict::Recreate { kind } => {
                info!(instance = %id, %kind, reasoning = %decision.reasoning, "Recreation due");
                self.events.publish(
                    id,
                    EventData::RecreationDecided {
                        kind: kind.to_string(),
                        confidence: decision.confidence,
                        reasoning: decision.reasoning.clone(),
                    },
                );
                self.run_recreation_action(slot, Some(*kind)).await?;
                return Ok(());
            }
            RecreationVerdict::PriceCheckFailed { .. } => {
                self.events.publish(
                    id,
                    EventData::RecreationDecided {
                        kind: "PRICE_CHECK_FAILED".to_string(),
                        confidence: decision.confidence,
                        reasoning: decision.reasoning.clone(),
                    },
                );
            }
            verdict => debug!(instance = %id, ?verdict, "Recreation check"),
        }

        let every = u64::from(config.stop_loss_every_n_ticks.max(1));
        if config.smart_stop_loss && tick_count % every == 0 {
            self.evaluate_stop_loss(slot, &snapshot).await?;
        }
        Ok(())
    }

    async fn evaluate_stop_loss(
        self: &Arc<Self>,
        slot: &Arc<InstanceSlot>,
        snapshot: &MarketSnapshot,
    ) -> ExecutionResult<()> {
        let id = &slot.id;
        {
            let mut state = slot.state.lock().await;
            if state.phase != Phase::Monitoring {
                return Ok(());
            }
            state.transition(id, Phase::Analyzing, &self.events);
        }

        let decision = self.stop_loss.evaluate(id, snapshot).await;
        if decision.action != StopLossAction::Hold {
            self.events.publish(
                id,
                EventData::StopLossDecided {
                    action: decision.action.to_string(),
                    risk_score: decision.risk_score,
                    confidence: decision.confidence,
                    reasoning: decision.reasoning.clone(),
                },
            );
        }

        match decision.action {
            StopLossAction::FullExit => {
                warn!(
                    instance = %id,
                    risk = %decision.risk_score,
                    urgency = ?decision.urgency,
                    reasoning = %decision.reasoning,
                    "Stop-loss triggered"
                );
                self.begin_stop_loss(slot, StoppingReason::StopLoss, &[Phase::Analyzing])
                    .await?;
                self.finish_stop_loss(slot, StoppingReason::StopLoss, decision.urgency)
                    .await?;
                return Ok(());
            }
            StopLossAction::PartialExit => {
                warn!(instance = %id, risk = %decision.risk_score, "Partial exit advised, not executed");
            }
            StopLossAction::Alert => {
                info!(instance = %id, risk = %decision.risk_score, reasoning = %decision.reasoning, "Stop-loss alert");
            }
            StopLossAction::Hold => {}
        }

        let mut state = slot.state.lock().await;
        if state.phase == Phase::Analyzing {
            state.transition(id, Phase::Monitoring, &self.events);
        }
        Ok(())
    }

    /// Updates the dynamic recreation gate from the benchmark yield.
    async fn update_dynamic_switch(&self, slot: &InstanceSlot, snapshot: &MarketSnapshot) {
        let mut state = slot.state.lock().await;
        let Some(settings) = state.config.dynamic_yield else {
            state.dynamic_switch.enabled = true;
            return;
        };
        if snapshot.simplified {
            return;
        }
        let Some(benchmark) = snapshot.benchmark_yield_pct else {
            return;
        };

        let enabled = benchmark >= settings.benchmark_threshold_pct;
        if enabled != state.dynamic_switch.enabled {
            info!(
                instance = %slot.id,
                benchmark = %benchmark,
                threshold = %settings.benchmark_threshold_pct,
                enabled,
                "Dynamic recreation switch flipped"
            );
        }
        state.dynamic_switch.enabled = enabled;
        state.dynamic_switch.last_benchmark_yield = Some(benchmark);
        state.dynamic_switch.last_update = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lp_keeper_domain::StrategyConfig;
    use rust_decimal_macros::dec;

    fn state(phase: Phase, reason: Option<StoppingReason>) -> InstanceState {
        let mut state = InstanceState::new(StrategyConfig::new("p", dec!(1)));
        state.phase = phase;
        state.stopping_reason = reason;
        state
    }

    #[test]
    fn test_branch_table() {
        let cases = [
            (Phase::Stopping, Some(StoppingReason::PositionRecreation), TickBranch::RetryRecreation),
            (Phase::Stopping, Some(StoppingReason::StopLoss), TickBranch::DeferToStopLoss),
            (Phase::Stopping, Some(StoppingReason::ManualStop), TickBranch::DeferToStopLoss),
            (Phase::Stopping, Some(StoppingReason::UserStop), TickBranch::Idle),
            (Phase::Cleaning, None, TickBranch::Cleanup),
            (Phase::Creating, None, TickBranch::RetryCreation),
            (Phase::Monitoring, None, TickBranch::Monitor),
            (Phase::Analyzing, None, TickBranch::Idle),
            (Phase::Stopped, Some(StoppingReason::UserStop), TickBranch::Idle),
            (Phase::Error, None, TickBranch::Idle),
        ];
        for (phase, reason, expected) in cases {
            assert_eq!(
                TickBranch::select(&state(phase, reason), false),
                expected,
                "{phase} / {reason:?}"
            );
        }
    }

    #[test]
    fn test_branch_respects_creation_and_pause() {
        let creating = state(Phase::Creating, None);
        assert_eq!(TickBranch::select(&creating, true), TickBranch::Idle);

        let mut created = state(Phase::Creating, None);
        created.has_been_created = true;
        assert_eq!(TickBranch::select(&created, false), TickBranch::Idle);

        let mut paused = state(Phase::Monitoring, None);
        paused.is_paused = true;
        assert_eq!(TickBranch::select(&paused, false), TickBranch::Paused);
    }
}
