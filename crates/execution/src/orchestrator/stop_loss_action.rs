//! Stop-loss exit sequence.

use super::PositionLifecycleOrchestrator;
use super::state::InstanceSlot;
use crate::error::{ExecutionError, ExecutionResult};
use lp_keeper_domain::{InstanceId, OperationClass, Phase, PositionAddress, StoppingReason, Urgency};
use lp_keeper_protocols::SwapReceipt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a completed stop-loss exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopLossOutcome {
    pub closed: Vec<PositionAddress>,
    /// Positions that could not be closed; they stay on the instance.
    pub failed: Vec<PositionAddress>,
    pub swap: Option<SwapReceipt>,
}

impl PositionLifecycleOrchestrator {
    /// Runs the full stop-loss sequence for a MONITORING instance.
    ///
    /// # Errors
    /// [`ExecutionError::InvalidPhase`] unless MONITORING, or the close
    /// failure when no position could be closed (the instance is then in
    /// ERROR).
    pub async fn run_stop_loss_action(
        self: &Arc<Self>,
        id: &InstanceId,
        reason: StoppingReason,
        urgency: Urgency,
    ) -> ExecutionResult<StopLossOutcome> {
        let slot = self.slot(id).await?;
        self.begin_stop_loss(&slot, reason, &[Phase::Monitoring])
            .await?;
        self.finish_stop_loss(&slot, reason, urgency).await
    }

    /// Claims the instance for a stop-loss: records the reason and moves to
    /// STOPPING, provided the phase is one of `from`.
    pub(crate) async fn begin_stop_loss(
        &self,
        slot: &InstanceSlot,
        reason: StoppingReason,
        from: &[Phase],
    ) -> ExecutionResult<()> {
        let mut state = slot.state.lock().await;
        if !from.contains(&state.phase) {
            return Err(ExecutionError::InvalidPhase {
                instance: slot.id.clone(),
                phase: state.phase,
                expected: Phase::Monitoring,
            });
        }
        state.stopping_reason = Some(reason);
        state.transition(&slot.id, Phase::Stopping, &self.events);
        Ok(())
    }

    /// Closes every position, swaps the residual balance and halts.
    pub(crate) async fn finish_stop_loss(
        &self,
        slot: &InstanceSlot,
        reason: StoppingReason,
        urgency: Urgency,
    ) -> ExecutionResult<StopLossOutcome> {
        let id = &slot.id;
        let (pool, addresses, slippage_bps) = {
            let state = slot.state.lock().await;
            (
                state.config.pool.clone(),
                state.position_addresses.clone(),
                state.config.stop_loss_slippage_bps,
            )
        };
        info!(instance = %id, %reason, ?urgency, positions = addresses.len(), "Executing stop-loss exit");

        if let Err(e) = self.deps.gas.prepare(OperationClass::StopLoss(urgency)).await {
            warn!(instance = %id, error = %e, "Gas preparation failed, continuing");
        }

        let report = self.close_all(id, &addresses).await;
        if !addresses.is_empty() && report.closed.is_empty() {
            let cause = report
                .failed
                .first()
                .map(|(_, e)| e.clone())
                .unwrap_or_else(|| ExecutionError::TaskFailed("no close attempted".to_string()));
            error!(instance = %id, error = %cause, "Stop-loss failed to close any position");
            self.fail_instance(slot, format!("stop-loss could not close any position: {cause}"))
                .await;
            return Err(cause);
        }

        let failed: Vec<PositionAddress> = report.failed.iter().map(|(a, _)| a.clone()).collect();
        if !failed.is_empty() {
            warn!(instance = %id, failed = failed.len(), "Stop-loss continuing with positions left open");
        }
        {
            let mut state = slot.state.lock().await;
            state
                .position_addresses
                .retain(|address| !report.closed.contains(address));
            if state.position_addresses.is_empty() {
                state.clear_positions();
            }
        }

        let swap = match self.swap_residual(slot, &pool, slippage_bps).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(instance = %id, error = %e, "Residual swap after stop-loss failed");
                None
            }
        };

        self.halt(slot, None).await;
        info!(instance = %id, closed = report.closed.len(), "Stop-loss exit complete");

        Ok(StopLossOutcome {
            closed: report.closed,
            failed,
            swap,
        })
    }
}
