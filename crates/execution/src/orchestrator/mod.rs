//! Position lifecycle orchestrator.
//!
//! Owns one state machine per strategy instance and drives it through
//! creation, monitoring, stop-loss exits, recreation and cleanup. Each
//! instance has its own monitoring timer; ticks never overlap and the
//! instance mutex is never held across a collaborator call.

mod cleanup;
mod creation;
mod recreation_action;
mod residual;
mod state;
mod stop_loss_action;
mod tick;

pub use recreation_action::RecreationOutcome;
pub use state::{
    CleanupState, DynamicSwitch, InstanceDiagnostics, InstanceState, InstanceStatus,
    ResourceCounts,
};
pub use stop_loss_action::StopLossOutcome;
pub use tick::TickBranch;

use crate::error::{ExecutionError, ExecutionResult};
use crate::events::{DEFAULT_EVENT_CAPACITY, EventBus, EventData, LifecycleEvent};
use crate::locks::{DEFAULT_LOCK_STALENESS, LockAcquisition, LockKind};
use crate::market_data::{MarketDataCollector, MarketDataConfig};
use crate::recreation::RecreationDecisionModule;
use crate::retry::{RetryExecutor, RetryOutcome, RetryPolicy};
use crate::stop_loss::{StopLossConfig, StopLossDecisionModule};
use lp_keeper_domain::{
    InstanceId, Phase, PositionAddress, StoppingReason, StrategyConfig, StrategyConfigPatch,
    Urgency,
};
use lp_keeper_protocols::{
    AnalyticsCollector, BalanceProvider, CloseReceipt, GasOptimizer, PositionManager,
    RangeProvider, SwapRouter,
};
use state::InstanceSlot;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub positions: Arc<dyn PositionManager>,
    pub ranges: Arc<dyn RangeProvider>,
    pub swaps: Arc<dyn SwapRouter>,
    pub balances: Arc<dyn BalanceProvider>,
    pub gas: Arc<dyn GasOptimizer>,
    pub analytics: Arc<dyn AnalyticsCollector>,
}

impl OrchestratorDeps {
    /// Uses one venue for every collaborator.
    pub fn from_venue<V>(venue: Arc<V>) -> Self
    where
        V: PositionManager
            + RangeProvider
            + SwapRouter
            + BalanceProvider
            + GasOptimizer
            + AnalyticsCollector
            + 'static,
    {
        Self {
            positions: venue.clone(),
            ranges: venue.clone(),
            swaps: venue.clone(),
            balances: venue.clone(),
            gas: venue.clone(),
            analytics: venue,
        }
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retry policy for each position close.
    pub close_retry: RetryPolicy,
    /// Retry policy for residual swaps.
    pub swap_retry: RetryPolicy,
    /// Age after which a recreation or swap lock is force-released.
    pub lock_staleness: Duration,
    /// Failed cleanup passes before the instance moves to ERROR.
    pub max_cleanup_attempts: u32,
    /// Failed creation attempts before the instance moves to ERROR.
    pub max_creation_attempts: u32,
    /// How long `delete` waits for the instance state before reporting busy.
    pub state_lock_timeout: Duration,
    pub market_data: MarketDataConfig,
    pub stop_loss: StopLossConfig,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            close_retry: RetryPolicy::close_position(),
            swap_retry: RetryPolicy::swap(),
            lock_staleness: DEFAULT_LOCK_STALENESS,
            max_cleanup_attempts: 3,
            max_creation_attempts: 3,
            state_lock_timeout: Duration::from_secs(5),
            market_data: MarketDataConfig::default(),
            stop_loss: StopLossConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Result of closing a batch of positions.
#[derive(Debug, Default)]
pub(crate) struct CloseReport {
    pub closed: Vec<PositionAddress>,
    pub failed: Vec<(PositionAddress, ExecutionError)>,
}

/// Drives every strategy instance.
pub struct PositionLifecycleOrchestrator {
    deps: OrchestratorDeps,
    config: OrchestratorConfig,
    instances: RwLock<HashMap<InstanceId, Arc<InstanceSlot>>>,
    market_data: MarketDataCollector,
    stop_loss: StopLossDecisionModule,
    recreation: RecreationDecisionModule,
    events: EventBus,
    close_retry: RetryExecutor,
    swap_retry: RetryExecutor,
    tick_ids: AtomicU64,
}

impl PositionLifecycleOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Arc<Self> {
        let market_data = MarketDataCollector::new(
            Arc::clone(&deps.analytics),
            Arc::clone(&deps.ranges),
            config.market_data.clone(),
        );
        Arc::new(Self {
            market_data,
            stop_loss: StopLossDecisionModule::new(config.stop_loss.clone()),
            recreation: RecreationDecisionModule::new(),
            events: EventBus::new(config.event_capacity),
            close_retry: RetryExecutor::new(config.close_retry.clone()),
            swap_retry: RetryExecutor::new(config.swap_retry.clone()),
            tick_ids: AtomicU64::new(0),
            instances: RwLock::new(HashMap::new()),
            deps,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn market_data(&self) -> &MarketDataCollector {
        &self.market_data
    }

    pub fn stop_loss_module(&self) -> &StopLossDecisionModule {
        &self.stop_loss
    }

    pub fn recreation_module(&self) -> &RecreationDecisionModule {
        &self.recreation
    }

    async fn slot(&self, id: &InstanceId) -> ExecutionResult<Arc<InstanceSlot>> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutionError::InstanceNotFound(id.clone()))
    }

    // Control commands

    /// Creates the instance and its positions, then starts monitoring.
    ///
    /// Idempotent: for an existing instance only the monitoring timer is
    /// (re)started. When creation fails the timer is still started so the
    /// retry and cleanup branches can run.
    ///
    /// # Errors
    /// Config validation errors, or the creation failure.
    pub async fn execute(
        self: &Arc<Self>,
        id: &InstanceId,
        config: StrategyConfig,
    ) -> ExecutionResult<InstanceStatus> {
        let slot = {
            let mut instances = self.instances.write().await;
            if let Some(existing) = instances.get(id).cloned() {
                drop(instances);
                debug!(instance = %id, "Instance exists, ensuring timer");
                existing.state.lock().await.is_active = true;
                self.ensure_timer(&existing).await;
                return Ok(existing.state.lock().await.status(id));
            }

            config.validate()?;
            let slot = Arc::new(InstanceSlot::new(
                id.clone(),
                config,
                self.config.lock_staleness,
            ));
            instances.insert(id.clone(), Arc::clone(&slot));
            slot
        };

        info!(instance = %id, "Executing new instance");
        slot.state.lock().await.is_active = true;
        let created = self.run_creation(&slot).await;
        self.ensure_timer(&slot).await;

        created?;
        Ok(slot.state.lock().await.status(id))
    }

    /// Resumes a stopped instance, reopening positions if none are left.
    ///
    /// A user-stopped CLEANING instance resumes its cleanup.
    ///
    /// # Errors
    /// [`ExecutionError::InstanceNotFound`], [`ExecutionError::InvalidPhase`]
    /// for instances in ERROR, [`ExecutionError::UntrackedPositions`] for a
    /// stopped instance holding positions without a known range, or the
    /// creation failure.
    pub async fn start(self: &Arc<Self>, id: &InstanceId) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;

        let needs_creation = {
            let mut state = slot.state.lock().await;
            match state.phase {
                Phase::Error => {
                    return Err(ExecutionError::InvalidPhase {
                        instance: id.clone(),
                        phase: Phase::Error,
                        expected: Phase::Stopped,
                    });
                }
                Phase::Stopped
                    if !state.position_addresses.is_empty() && state.position_range.is_none() =>
                {
                    return Err(ExecutionError::UntrackedPositions {
                        instance: id.clone(),
                        count: state.position_addresses.len(),
                    });
                }
                _ => {}
            }

            state.is_active = true;
            state.is_paused = false;
            if state.stopping_reason == Some(StoppingReason::UserStop) {
                state.stopping_reason = None;
            }
            match state.phase {
                Phase::Stopped if state.position_addresses.is_empty() => {
                    state.stopping_reason = None;
                    state.clear_positions();
                    state.has_been_created = false;
                    state.creation_attempts = 0;
                    true
                }
                Phase::Stopped => {
                    state.stopping_reason = None;
                    state.transition(id, Phase::Monitoring, &self.events);
                    false
                }
                _ => false,
            }
        };

        let created = if needs_creation {
            self.run_creation(&slot).await
        } else {
            Ok(())
        };
        self.ensure_timer(&slot).await;

        created?;
        Ok(slot.state.lock().await.status(id))
    }

    /// Stops monitoring and marks the instance `USER_STOP`.
    ///
    /// The instance moves to STOPPED, except while CLEANING: it then stays
    /// CLEANING with its cleanup targets and resumes on `start`. An action
    /// already in flight runs to completion but opens no new positions.
    ///
    /// # Errors
    /// [`ExecutionError::InstanceNotFound`], or
    /// [`ExecutionError::InvalidPhase`] for instances in ERROR.
    pub async fn stop(&self, id: &InstanceId) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;
        let mut state = slot.state.lock().await;
        if state.phase == Phase::Error {
            return Err(ExecutionError::InvalidPhase {
                instance: id.clone(),
                phase: Phase::Error,
                expected: Phase::Monitoring,
            });
        }

        slot.cancel_timer();
        state.is_active = false;
        state.is_paused = false;
        state.stopping_reason = Some(StoppingReason::UserStop);
        if state.phase == Phase::Cleaning {
            info!(instance = %id, "Instance stopped by user, cleanup pending");
        } else {
            state.transition(id, Phase::Stopped, &self.events);
            info!(instance = %id, "Instance stopped by user");
        }
        Ok(state.status(id))
    }

    /// Stops the timer without touching the phase.
    ///
    /// # Errors
    /// [`ExecutionError::InstanceNotFound`].
    pub async fn pause(&self, id: &InstanceId) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;
        slot.cancel_timer();
        let mut state = slot.state.lock().await;
        state.is_paused = true;
        info!(instance = %id, "Instance paused");
        Ok(state.status(id))
    }

    /// # Errors
    /// [`ExecutionError::InstanceNotFound`].
    pub async fn resume(self: &Arc<Self>, id: &InstanceId) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;
        let active = {
            let mut state = slot.state.lock().await;
            state.is_paused = false;
            state.is_active
        };
        if active {
            self.ensure_timer(&slot).await;
        }
        info!(instance = %id, "Instance resumed");
        Ok(slot.state.lock().await.status(id))
    }

    /// Starts a stop-loss exit with reason `MANUAL_STOP`.
    ///
    /// Returns once the instance is STOPPING; closing and swapping continue in
    /// the background.
    ///
    /// # Errors
    /// [`ExecutionError::InvalidPhase`] unless the instance is MONITORING.
    pub async fn manual_stop_loss(self: &Arc<Self>, id: &InstanceId) -> ExecutionResult<()> {
        let slot = self.slot(id).await?;
        self.begin_stop_loss(&slot, StoppingReason::ManualStop, &[Phase::Monitoring])
            .await?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this
                .finish_stop_loss(&slot, StoppingReason::ManualStop, Urgency::High)
                .await
            {
                warn!(instance = %slot.id, error = %e, "Manual stop-loss failed");
            }
        });
        Ok(())
    }

    /// Replaces the config of a stopped instance.
    ///
    /// # Errors
    /// [`ExecutionError::NotStopped`] unless the instance is STOPPED, or the
    /// validation error of the patched config.
    pub async fn update_config(
        &self,
        id: &InstanceId,
        patch: &StrategyConfigPatch,
    ) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;
        let mut state = slot.state.lock().await;
        if state.phase != Phase::Stopped {
            return Err(ExecutionError::NotStopped(id.clone()));
        }
        state.config = patch.apply(&state.config)?;
        info!(instance = %id, "Config updated");
        Ok(state.status(id))
    }

    /// # Errors
    /// [`ExecutionError::InstanceNotFound`].
    pub async fn get_status(&self, id: &InstanceId) -> ExecutionResult<InstanceStatus> {
        let slot = self.slot(id).await?;
        let state = slot.state.lock().await;
        Ok(state.status(id))
    }

    /// Stops the timer, releases every per-instance resource and forgets the
    /// instance. Positions are left as they are.
    ///
    /// # Errors
    /// [`ExecutionError::Busy`] when the instance state stays locked past the
    /// configured timeout.
    pub async fn delete(&self, id: &InstanceId) -> ExecutionResult<()> {
        let slot = self.slot(id).await?;
        let state = tokio::time::timeout(self.config.state_lock_timeout, slot.state.lock())
            .await
            .map_err(|_| ExecutionError::Busy(id.clone()))?;
        slot.cancel_timer();
        drop(state);

        self.release_resources(id).await;
        info!(instance = %id, "Instance deleted");
        Ok(())
    }

    /// Releases everything held for `id` without waiting for its state.
    /// Returns whether the instance existed.
    pub async fn release_resources(&self, id: &InstanceId) -> bool {
        let slot = self.instances.write().await.remove(id);
        if let Some(slot) = &slot {
            slot.cancel_timer();
            slot.recreation_lock.force_release();
            slot.swap_lock.force_release();
        }
        self.market_data.release(id).await;
        self.deps.analytics.release(id).await;
        self.stop_loss.purge(id).await;
        self.recreation.reset(id).await;
        slot.is_some()
    }

    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// # Errors
    /// [`ExecutionError::InstanceNotFound`].
    pub async fn diagnostics(&self, id: &InstanceId) -> ExecutionResult<InstanceDiagnostics> {
        let slot = self.slot(id).await?;
        let state = slot.state.lock().await;
        Ok(InstanceDiagnostics {
            instance_id: id.clone(),
            phase: state.phase,
            stopping_reason: state.stopping_reason,
            is_active: state.is_active,
            is_paused: state.is_paused,
            time_in_phase: state.phase_entered_at.elapsed(),
            since_last_tick: state.last_tick_at.map(|at| at.elapsed()),
            monitoring_interval: state.config.monitoring_interval(),
            timer_running: slot.timer_running(),
            tick_in_flight: slot.tick_running.load(Ordering::Acquire),
            recreation_lock_held_for: slot.recreation_lock.held_for(),
            swap_lock_held_for: slot.swap_lock.held_for(),
            cleanup_retry_count: state.cleanup.retry_count(),
        })
    }

    pub async fn resource_counts(&self) -> ResourceCounts {
        let slots: Vec<Arc<InstanceSlot>> = self.instances.read().await.values().cloned().collect();
        ResourceCounts {
            instances: slots.len(),
            running_timers: slots.iter().filter(|s| s.timer_running()).count(),
            cached_snapshots: self.market_data.cached_count().await,
            stop_loss_windows: self.stop_loss.window_count().await,
            recreation_trackers: self.recreation.tracked_count().await,
            held_locks: slots.iter().map(|s| s.held_locks()).sum(),
        }
    }

    // Shared helpers

    /// Starts the monitoring timer unless one is running, or the instance is
    /// inactive, paused or in ERROR. Ticks are spaced by the monitoring
    /// interval, measured from the end of the previous tick.
    async fn ensure_timer(self: &Arc<Self>, slot: &Arc<InstanceSlot>) {
        let interval = {
            let state = slot.state.lock().await;
            if !state.is_active || state.is_paused || state.phase == Phase::Error {
                return;
            }
            state.config.monitoring_interval()
        };
        let weak = Arc::downgrade(self);
        let timer_slot = Arc::clone(slot);

        let started = slot.install_timer(move |cancel| {
            tokio::spawn(async move {
                let id = timer_slot.id.clone();
                let mut interval = interval;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let Some(orchestrator) = weak.upgrade() else {
                        break;
                    };
                    match orchestrator.run_cycle(&id).await {
                        Ok(branch) => debug!(instance = %id, ?branch, "Tick finished"),
                        Err(ExecutionError::InstanceNotFound(_)) => break,
                        Err(e) => warn!(instance = %id, error = %e, "Tick failed"),
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    interval = timer_slot.state.lock().await.config.monitoring_interval();
                }
                debug!(instance = %id, "Monitoring timer exited");
            })
        });
        if started {
            debug!(instance = %slot.id, ?interval, "Monitoring timer started");
        }
    }

    /// Closes `addresses` concurrently, each under the close retry policy.
    /// Already-absent positions count as closed.
    async fn close_all(&self, instance: &InstanceId, addresses: &[PositionAddress]) -> CloseReport {
        let tasks: Vec<(PositionAddress, JoinHandle<ExecutionResult<RetryOutcome<CloseReceipt>>>)> =
            addresses
                .iter()
                .cloned()
                .map(|address| {
                    let positions = Arc::clone(&self.deps.positions);
                    let retry = self.close_retry.clone();
                    let target = address.clone();
                    let handle = tokio::spawn(async move {
                        retry
                            .run("close_position", || positions.close(&target))
                            .await
                    });
                    (address, handle)
                })
                .collect();

        let mut report = CloseReport::default();
        for (address, handle) in tasks {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(ExecutionError::TaskFailed(e.to_string())));
            match result {
                Ok(outcome) => {
                    let already_closed = outcome.already_closed();
                    info!(instance = %instance, position = %address, already_closed, "Position closed");
                    self.events.publish(
                        instance,
                        EventData::PositionClosed {
                            address: address.clone(),
                            already_closed,
                        },
                    );
                    report.closed.push(address);
                }
                Err(e) => {
                    warn!(instance = %instance, position = %address, error = %e, "Failed to close position");
                    report.failed.push((address, e));
                }
            }
        }
        report
    }

    /// Takes one of the instance's locks, reporting a forced release.
    fn acquire_lock(
        &self,
        slot: &InstanceSlot,
        kind: LockKind,
    ) -> ExecutionResult<LockAcquisition> {
        let lock = match kind {
            LockKind::Recreation => &slot.recreation_lock,
            LockKind::Swap => &slot.swap_lock,
        };
        let acquisition = lock.try_acquire(&slot.id)?;
        if let Some(held_for) = acquisition.forced_release {
            warn!(
                instance = %slot.id,
                lock = kind.name(),
                held_secs = held_for.as_secs(),
                "Stale lock force-released"
            );
            self.events.publish(
                &slot.id,
                EventData::LockForceReleased {
                    lock: kind.name().to_string(),
                    held_secs: held_for.as_secs(),
                },
            );
        }
        Ok(acquisition)
    }

    /// Puts an instance into ERROR and stops its timer.
    async fn fail_instance(&self, slot: &InstanceSlot, message: String) {
        slot.cancel_timer();
        let mut state = slot.state.lock().await;
        state.last_error = Some(message.clone());
        state.is_active = false;
        state.transition(&slot.id, Phase::Error, &self.events);
        self.events.publish(&slot.id, EventData::Error { message });
    }

    /// Moves to STOPPED and releases decision-module state.
    async fn halt(&self, slot: &InstanceSlot, reason: Option<StoppingReason>) {
        slot.cancel_timer();
        {
            let mut state = slot.state.lock().await;
            state.stopping_reason = reason;
            state.is_active = false;
            state.transition(&slot.id, Phase::Stopped, &self.events);
        }
        self.recreation.reset(&slot.id).await;
        self.stop_loss.purge(&slot.id).await;
    }

    fn next_tick_id(&self) -> u64 {
        self.tick_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lp_keeper_protocols::PaperVenue;
    use rust_decimal_macros::dec;

    fn orchestrator(venue: &Arc<PaperVenue>) -> Arc<PositionLifecycleOrchestrator> {
        let config = OrchestratorConfig {
            close_retry: RetryPolicy::close_position().with_delay(Duration::ZERO),
            swap_retry: RetryPolicy::swap().with_delay(Duration::ZERO),
            ..Default::default()
        };
        PositionLifecycleOrchestrator::new(OrchestratorDeps::from_venue(Arc::clone(venue)), config)
    }

    fn strategy() -> StrategyConfig {
        let mut config = StrategyConfig::new("pool-1", dec!(100));
        config.range_width_bins = 10;
        config.monitoring_interval_secs = 3600;
        config
    }

    #[tokio::test]
    async fn test_execute_creates_and_monitors() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");

        let status = orchestrator.execute(&id, strategy()).await.unwrap();
        assert_eq!(status.phase, Phase::Monitoring);
        assert!(status.is_active);
        assert_eq!(status.position_addresses.len(), 1);
        assert_eq!(
            status.position_range,
            Some(lp_keeper_domain::BinRange::new(10, 20).unwrap())
        );
        assert_eq!(
            venue.tracked_positions(&id).await,
            Some(status.position_addresses.clone())
        );
        assert!(orchestrator.diagnostics(&id).await.unwrap().timer_running);
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_config() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let result = orchestrator
            .execute(&InstanceId::from("i-1"), StrategyConfig::new("pool-1", dec!(0)))
            .await;
        assert!(matches!(result, Err(ExecutionError::Domain(_))));
        assert!(orchestrator.instance_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_pause_resume() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();

        let paused = orchestrator.pause(&id).await.unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.phase, Phase::Monitoring);
        assert!(!orchestrator.diagnostics(&id).await.unwrap().timer_running);
        assert_eq!(orchestrator.run_cycle(&id).await.unwrap(), TickBranch::Paused);

        orchestrator.resume(&id).await.unwrap();
        assert!(orchestrator.diagnostics(&id).await.unwrap().timer_running);

        let stopped = orchestrator.stop(&id).await.unwrap();
        assert_eq!(stopped.phase, Phase::Stopped);
        assert_eq!(stopped.stopping_reason, Some(StoppingReason::UserStop));
        assert!(!stopped.is_active);
        assert_eq!(stopped.position_addresses.len(), 1);

        let restarted = orchestrator.start(&id).await.unwrap();
        assert_eq!(restarted.phase, Phase::Monitoring);
        assert_eq!(restarted.stopping_reason, None);
        assert_eq!(venue.open_calls().await, 1);
    }

    #[tokio::test]
    async fn test_update_config_when_stopped() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator.stop(&id).await.unwrap();

        let patch = StrategyConfigPatch {
            range_width_bins: Some(20),
            ..Default::default()
        };
        orchestrator.update_config(&id, &patch).await.unwrap();

        let bad = StrategyConfigPatch {
            position_amount: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(matches!(
            orchestrator.update_config(&id, &bad).await,
            Err(ExecutionError::Domain(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator.run_cycle(&id).await.unwrap();
        assert_eq!(orchestrator.resource_counts().await.cached_snapshots, 1);

        orchestrator.delete(&id).await.unwrap();
        assert_eq!(orchestrator.resource_counts().await, ResourceCounts::default());
        assert!(venue.tracked_positions(&id).await.is_none());
        assert!(matches!(
            orchestrator.get_status(&id).await,
            Err(ExecutionError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_stop_loss_requires_monitoring() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator.stop(&id).await.unwrap();

        assert!(matches!(
            orchestrator.manual_stop_loss(&id).await,
            Err(ExecutionError::InvalidPhase { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_refuses_positions_without_range() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator.stop(&id).await.unwrap();
        orchestrator.slot(&id).await.unwrap().state.lock().await.position_range = None;

        assert!(matches!(
            orchestrator.start(&id).await,
            Err(ExecutionError::UntrackedPositions { count: 1, .. })
        ));
        let status = orchestrator.get_status(&id).await.unwrap();
        assert_eq!(status.phase, Phase::Stopped);
        assert!(!status.is_active);
        assert!(!orchestrator.diagnostics(&id).await.unwrap().timer_running);
    }

    #[tokio::test]
    async fn test_creation_skipped_after_user_stop() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator.stop(&id).await.unwrap();

        let slot = orchestrator.slot(&id).await.unwrap();
        orchestrator.run_creation(&slot).await.unwrap();

        let status = orchestrator.get_status(&id).await.unwrap();
        assert_eq!(status.phase, Phase::Stopped);
        assert_eq!(status.stopping_reason, Some(StoppingReason::UserStop));
        assert_eq!(venue.open_calls().await, 1);
    }

    #[tokio::test]
    async fn test_stop_loss_without_positions_stops() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        orchestrator.execute(&id, strategy()).await.unwrap();
        orchestrator
            .slot(&id)
            .await
            .unwrap()
            .state
            .lock()
            .await
            .clear_positions();

        let outcome = orchestrator
            .run_stop_loss_action(&id, StoppingReason::StopLoss, Urgency::High)
            .await
            .unwrap();
        assert!(outcome.closed.is_empty());
        assert_eq!(venue.close_calls().await, 0);
        let status = orchestrator.get_status(&id).await.unwrap();
        assert_eq!(status.phase, Phase::Stopped);
        assert_eq!(status.stopping_reason, None);
    }

    #[tokio::test]
    async fn test_stop_loss_with_no_closable_position_errors() {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let orchestrator = orchestrator(&venue);
        let id = InstanceId::from("i-1");
        let status = orchestrator.execute(&id, strategy()).await.unwrap();
        venue
            .fail_close_always(
                &status.position_addresses[0],
                lp_keeper_protocols::ProtocolError::Rpc("node unhealthy".into()),
            )
            .await;

        assert!(
            orchestrator
                .run_stop_loss_action(&id, StoppingReason::StopLoss, Urgency::High)
                .await
                .is_err()
        );
        let status = orchestrator.get_status(&id).await.unwrap();
        assert_eq!(status.phase, Phase::Error);
        assert_eq!(status.position_addresses.len(), 1);
        assert!(!orchestrator.diagnostics(&id).await.unwrap().timer_running);
    }
}
