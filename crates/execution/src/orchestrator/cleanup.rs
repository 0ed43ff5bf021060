//! Cleanup after a partially failed creation.

use super::PositionLifecycleOrchestrator;
use super::state::{CleanupState, InstanceSlot};
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::EventData;
use chrono::Utc;
use lp_keeper_domain::Phase;
use tracing::{info, warn};

impl PositionLifecycleOrchestrator {
    /// One cleanup pass: tries to close every remaining target.
    ///
    /// Once all targets are closed (or already gone) the instance returns to
    /// CREATING with no positions. Each pass that leaves targets behind counts
    /// as a failed attempt; the last allowed one moves the instance to ERROR.
    pub(crate) async fn run_cleanup(&self, slot: &InstanceSlot) -> ExecutionResult<()> {
        let id = &slot.id;
        let (retry_count, targets) = {
            let state = slot.state.lock().await;
            match &state.cleanup {
                CleanupState::Active {
                    retry_count,
                    targets,
                    ..
                } => (*retry_count, targets.clone()),
                CleanupState::Idle => (0, state.position_addresses.clone()),
            }
        };

        let report = self.close_all(id, &targets).await;

        if report.failed.is_empty() {
            let mut state = slot.state.lock().await;
            state.cleanup = CleanupState::Idle;
            state.clear_positions();
            state.has_been_created = false;
            state.creation_attempts = 0;
            state.transition(id, Phase::Creating, &self.events);
            info!(instance = %id, closed = report.closed.len(), "Cleanup complete, recreating");
            return Ok(());
        }

        let retry_count = retry_count + 1;
        let remaining: Vec<_> = report.failed.iter().map(|(a, _)| a.clone()).collect();
        self.events.publish(
            id,
            EventData::CleanupAttempt {
                retry_count,
                remaining: remaining.len(),
            },
        );
        {
            let mut state = slot.state.lock().await;
            state
                .position_addresses
                .retain(|address| !report.closed.contains(address));
            state.cleanup = CleanupState::Active {
                retry_count,
                targets: remaining.clone(),
                last_attempt: Some(Utc::now()),
            };
        }

        let cause = report
            .failed
            .into_iter()
            .next()
            .map(|(_, e)| e)
            .unwrap_or_else(|| ExecutionError::TaskFailed("cleanup".to_string()));

        if retry_count >= self.config.max_cleanup_attempts {
            self.fail_instance(
                slot,
                format!(
                    "cleanup failed after {retry_count} attempts, {} position(s) left: {cause}",
                    remaining.len()
                ),
            )
            .await;
        } else {
            warn!(instance = %id, retry_count, remaining = remaining.len(), error = %cause, "Cleanup pass incomplete");
        }
        Err(cause)
    }
}
