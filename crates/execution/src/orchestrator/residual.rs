//! Swapping leftover token A back to token B after positions close.

use super::PositionLifecycleOrchestrator;
use super::state::InstanceSlot;
use crate::error::ExecutionResult;
use crate::events::EventData;
use crate::locks::LockKind;
use lp_keeper_domain::{OperationClass, to_atomic};
use lp_keeper_protocols::{SwapReceipt, SwapRequest};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

impl PositionLifecycleOrchestrator {
    /// Swaps the wallet's whole token-A balance into token B.
    ///
    /// Returns `None` when there was nothing to swap.
    ///
    /// # Errors
    /// Lock contention, balance or pool lookups, or the swap itself after its
    /// retries are spent.
    pub(crate) async fn swap_residual(
        &self,
        slot: &InstanceSlot,
        pool: &str,
        slippage_bps: u16,
    ) -> ExecutionResult<Option<SwapReceipt>> {
        let id = &slot.id;
        let _lock = self.acquire_lock(slot, LockKind::Swap)?;

        let info = self.deps.ranges.pool_info(pool).await?;
        let balance = self.deps.balances.token_balance(&info.token_a).await?;
        if balance <= Decimal::ZERO {
            debug!(instance = %id, "No residual balance to swap");
            return Ok(None);
        }

        let decimals = self.token_decimals(slot, &info.token_a).await?;
        let amount_atomic = to_atomic(balance, decimals)?;
        if amount_atomic == 0 {
            return Ok(None);
        }

        if let Err(e) = self.deps.gas.prepare(OperationClass::Swap).await {
            warn!(instance = %id, error = %e, "Gas preparation failed, continuing");
        }

        let request = SwapRequest {
            input_mint: info.token_a.clone(),
            output_mint: info.token_b.clone(),
            amount_atomic,
            slippage_bps,
        };
        let receipt = self
            .swap_retry
            .run("swap", || self.deps.swaps.swap(&request))
            .await?
            .into_value();

        if let Some(receipt) = &receipt {
            info!(
                instance = %id,
                amount = %balance,
                amount_atomic,
                output_atomic = receipt.output_amount_atomic,
                "Residual balance swapped"
            );
            self.events.publish(
                id,
                EventData::SwapExecuted {
                    input_mint: request.input_mint.clone(),
                    amount_atomic,
                    output_amount_atomic: receipt.output_amount_atomic,
                },
            );
        }
        Ok(receipt)
    }

    /// Token precision, cached per instance.
    async fn token_decimals(&self, slot: &InstanceSlot, mint: &str) -> ExecutionResult<u8> {
        if let Some(decimals) = slot.decimals.read().await.get(mint) {
            return Ok(*decimals);
        }
        let decimals = self.deps.balances.token_decimals(mint).await?;
        slot.decimals.write().await.insert(mint.to_string(), decimals);
        Ok(decimals)
    }
}
