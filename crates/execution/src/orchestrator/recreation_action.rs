//! Recreation sequence: close, swap, check guards, reopen.

use super::PositionLifecycleOrchestrator;
use super::state::InstanceSlot;
use crate::error::{ExecutionError, ExecutionResult};
use crate::locks::LockKind;
use crate::recreation::RecreationKind;
use lp_keeper_domain::{BinRange, Phase, PositionAddress, PriceGuardMode, StoppingReason};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreationOutcome {
    /// New positions are open and monitored.
    Recreated {
        range: BinRange,
        positions: Vec<PositionAddress>,
    },
    /// Some closes failed; the instance stays STOPPING and the next tick
    /// retries.
    Deferred { failed: Vec<PositionAddress> },
    /// A guard or a user stop halted the strategy.
    Halted { reason: String },
}

impl PositionLifecycleOrchestrator {
    /// Runs (or resumes) the recreation sequence.
    ///
    /// # Errors
    /// [`ExecutionError::LockContention`] when another recreation holds the
    /// lock, [`ExecutionError::InvalidPhase`] when the instance is neither
    /// monitoring nor stopping for recreation, or the creation failure.
    pub(crate) async fn run_recreation_action(
        &self,
        slot: &InstanceSlot,
        kind: Option<RecreationKind>,
    ) -> ExecutionResult<RecreationOutcome> {
        let id = &slot.id;
        let _lock = self.acquire_lock(slot, LockKind::Recreation)?;

        let (config, addresses) = {
            let mut state = slot.state.lock().await;
            match (state.phase, state.stopping_reason) {
                (Phase::Monitoring | Phase::Analyzing, _) => {
                    state.stopping_reason = Some(StoppingReason::PositionRecreation);
                    state.transition(id, Phase::Stopping, &self.events);
                }
                (Phase::Stopping, Some(StoppingReason::PositionRecreation)) => {
                    info!(instance = %id, "Resuming recreation");
                }
                (phase, _) => {
                    return Err(ExecutionError::InvalidPhase {
                        instance: id.clone(),
                        phase,
                        expected: Phase::Monitoring,
                    });
                }
            }
            (state.config.clone(), state.position_addresses.clone())
        };
        info!(instance = %id, kind = ?kind, positions = addresses.len(), "Recreating positions");

        let report = self.close_all(id, &addresses).await;
        {
            let mut state = slot.state.lock().await;
            state
                .position_addresses
                .retain(|address| !report.closed.contains(address));
            if state.position_addresses.is_empty() {
                state.clear_positions();
            }
        }
        if !report.failed.is_empty() {
            let failed: Vec<PositionAddress> =
                report.failed.into_iter().map(|(address, _)| address).collect();
            warn!(instance = %id, failed = failed.len(), "Recreation deferred, closes pending");
            return Ok(RecreationOutcome::Deferred { failed });
        }

        if let Err(e) = self
            .swap_residual(slot, &config.pool, config.slippage_bps)
            .await
        {
            warn!(instance = %id, error = %e, "Residual swap before recreation failed");
        }

        if let Some(reason) = self.recreation_blocked(slot).await? {
            warn!(instance = %id, reason = %reason, "Recreation blocked, halting strategy");
            self.halt(slot, Some(StoppingReason::ManualStop)).await;
            return Ok(RecreationOutcome::Halted { reason });
        }

        self.recreation.reset(id).await;
        self.stop_loss.purge(id).await;
        self.run_creation(slot).await?;

        let state = slot.state.lock().await;
        match (state.phase, state.position_range) {
            (Phase::Stopped, _) => Ok(RecreationOutcome::Halted {
                reason: "stopped by user".to_string(),
            }),
            (_, Some(range)) => Ok(RecreationOutcome::Recreated {
                range,
                positions: state.position_addresses.clone(),
            }),
            (_, None) => Err(ExecutionError::CreationFailed(
                "no range after recreation".to_string(),
            )),
        }
    }

    /// Checks the halt-mode price guard and the dynamic yield gate.
    async fn recreation_blocked(&self, slot: &InstanceSlot) -> ExecutionResult<Option<String>> {
        let (config, switch) = {
            let state = slot.state.lock().await;
            (state.config.clone(), state.dynamic_switch)
        };

        if config.price_guard.applies_to(PriceGuardMode::HaltStrategy) {
            let info = self.deps.ranges.pool_info(&config.pool).await?;
            if let Some(violation) = config.price_guard.band.violation(info.active_price) {
                return Ok(Some(violation.to_string()));
            }
        }

        if let Some(settings) = config.dynamic_yield
            && !switch.enabled
        {
            return Ok(Some(format!(
                "benchmark yield {} below threshold {}",
                switch
                    .last_benchmark_yield
                    .map(|y| y.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                settings.benchmark_threshold_pct
            )));
        }
        Ok(None)
    }
}
