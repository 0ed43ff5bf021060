//! Opening positions around the active bin.

use super::PositionLifecycleOrchestrator;
use super::state::{CleanupState, FlagGuard, InstanceSlot};
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::EventData;
use chrono::Utc;
use lp_keeper_domain::{
    BinRange, InstanceId, OperationClass, Phase, PositionAddress, StrategyConfig,
};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

/// Positions opened by one creation.
#[derive(Debug, Clone)]
pub(crate) struct CreatedPositions {
    pub range: BinRange,
    pub addresses: Vec<PositionAddress>,
    pub deposited: Decimal,
}

/// Splits `total` across `parts` in proportion to their bin counts. The last
/// part takes the rounding remainder.
pub(crate) fn allocate(total: Decimal, parts: &[BinRange]) -> Vec<Decimal> {
    let bins: u32 = parts.iter().map(BinRange::bin_count).sum();
    if parts.len() <= 1 || bins == 0 {
        return vec![total; parts.len().min(1)];
    }

    let mut remaining = total;
    let mut amounts = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        if i + 1 == parts.len() {
            amounts.push(remaining);
        } else {
            let share = (total * Decimal::from(part.bin_count()) / Decimal::from(bins)).round_dp(9);
            remaining -= share;
            amounts.push(share);
        }
    }
    amounts
}

impl PositionLifecycleOrchestrator {
    /// Runs one creation attempt and applies its outcome:
    /// - success: MONITORING with the new positions
    /// - partial success: CLEANING with the opened positions as targets
    /// - failure: stays CREATING for the next tick, or ERROR once the attempt
    ///   budget is spent
    ///
    /// A user stop wins: nothing is opened for a stopped instance, and
    /// positions opened while the stop came in are kept under STOPPED.
    pub(crate) async fn run_creation(&self, slot: &InstanceSlot) -> ExecutionResult<()> {
        let id = &slot.id;
        let Some(_creating) = FlagGuard::try_raise(&slot.creating) else {
            return Err(ExecutionError::Busy(id.clone()));
        };

        let (config, attempt) = {
            let mut state = slot.state.lock().await;
            if state.stopped_by_user() {
                info!(instance = %id, "Instance stopped by user, not creating positions");
                state.transition(id, Phase::Stopped, &self.events);
                return Ok(());
            }
            state.stopping_reason = None;
            state.has_been_created = false;
            state.creation_attempts += 1;
            state.transition(id, Phase::Creating, &self.events);
            (state.config.clone(), state.creation_attempts)
        };

        match self.open_positions(id, &config).await {
            Ok(created) => {
                {
                    let mut state = slot.state.lock().await;
                    state.position_addresses = created.addresses.clone();
                    state.position_range = Some(created.range);
                    state.deposited = created.deposited;
                    state.opened_at = Some(Utc::now());
                    state.has_been_created = true;
                    state.creation_attempts = 0;
                    state.last_error = None;
                    if state.stopped_by_user() {
                        warn!(instance = %id, "Instance stopped during creation, keeping positions");
                        state.transition(id, Phase::Stopped, &self.events);
                    } else {
                        state.transition(id, Phase::Monitoring, &self.events);
                    }
                }
                if let Err(e) = self
                    .deps
                    .analytics
                    .update_tracked_positions(id, &created.addresses)
                    .await
                {
                    warn!(instance = %id, error = %e, "Failed to update tracked positions");
                }
                info!(
                    instance = %id,
                    range = %created.range,
                    positions = created.addresses.len(),
                    "Positions created"
                );
                Ok(())
            }
            Err(ExecutionError::PartiallyCreated { opened, reason }) => {
                warn!(instance = %id, opened = opened.len(), reason = %reason, "Creation partially failed, cleaning up");
                let mut state = slot.state.lock().await;
                state.position_addresses = opened.clone();
                state.last_error = Some(reason.clone());
                state.cleanup = CleanupState::Active {
                    retry_count: 0,
                    targets: opened.clone(),
                    last_attempt: None,
                };
                state.transition(id, Phase::Cleaning, &self.events);
                Err(ExecutionError::PartiallyCreated { opened, reason })
            }
            Err(e) => {
                let message = e.to_string();
                let mut state = slot.state.lock().await;
                if state.stopped_by_user() {
                    warn!(instance = %id, error = %message, "Creation failed after user stop");
                    state.last_error = Some(message);
                    state.transition(id, Phase::Stopped, &self.events);
                    return Err(e);
                }
                drop(state);
                if attempt >= self.config.max_creation_attempts {
                    error!(instance = %id, attempt, error = %message, "Creation attempts exhausted");
                    self.fail_instance(slot, format!("creation failed after {attempt} attempts: {message}"))
                        .await;
                } else {
                    warn!(instance = %id, attempt, error = %message, "Creation failed, will retry");
                    slot.state.lock().await.last_error = Some(message);
                }
                Err(e)
            }
        }
    }

    /// Opens positions covering a range centered on the active bin.
    ///
    /// # Errors
    /// [`ExecutionError::CreationFailed`] when nothing was opened,
    /// [`ExecutionError::PartiallyCreated`] when some positions were opened
    /// before a later one failed.
    pub(crate) async fn open_positions(
        &self,
        id: &InstanceId,
        config: &StrategyConfig,
    ) -> ExecutionResult<CreatedPositions> {
        let active = self
            .deps
            .ranges
            .active_index(&config.pool)
            .await
            .map_err(|e| ExecutionError::CreationFailed(e.to_string()))?;
        let range = BinRange::centered(active, config.range_width_bins);
        let parts = range.split(config.max_bins_per_position);
        let amounts = allocate(config.position_amount, &parts);

        if let Err(e) = self.deps.gas.prepare(OperationClass::OpenPosition).await {
            warn!(instance = %id, error = %e, "Gas preparation failed, continuing");
        }

        let mut opened = Vec::with_capacity(parts.len());
        for (part, amount) in parts.iter().zip(amounts) {
            match self.deps.positions.open(&config.pool, *part, amount).await {
                Ok(position) => {
                    info!(instance = %id, position = %position.address, range = %part, amount = %amount, "Position opened");
                    self.events.publish(
                        id,
                        EventData::PositionOpened {
                            address: position.address.clone(),
                            range: *part,
                            amount,
                        },
                    );
                    opened.push(position.address);
                }
                Err(e) if opened.is_empty() => {
                    return Err(ExecutionError::CreationFailed(e.to_string()));
                }
                Err(e) => {
                    return Err(ExecutionError::PartiallyCreated {
                        opened,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(CreatedPositions {
            range,
            addresses: opened,
            deposited: config.position_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_allocate_by_bin_count() {
        let parts = BinRange::new(10, 20).unwrap().split(6);
        let amounts = allocate(dec!(110), &parts);
        assert_eq!(amounts, vec![dec!(60), dec!(50)]);
        assert_eq!(amounts.iter().sum::<Decimal>(), dec!(110));
    }

    #[test]
    fn test_allocate_single_part() {
        let parts = vec![BinRange::new(10, 20).unwrap()];
        assert_eq!(allocate(dec!(100), &parts), vec![dec!(100)]);
    }

    #[test]
    fn test_allocate_keeps_remainder() {
        let parts = BinRange::new(0, 2).unwrap().split(2);
        let amounts = allocate(dec!(1), &parts);
        assert_eq!(amounts.iter().sum::<Decimal>(), dec!(1));
    }
}
