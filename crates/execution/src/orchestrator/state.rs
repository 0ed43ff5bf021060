//! Per-instance state owned by the orchestrator.

use crate::events::{EventBus, EventData};
use crate::locks::{InstanceLock, LockKind};
use chrono::{DateTime, Utc};
use lp_keeper_domain::{
    BinRange, InstanceId, Phase, PositionAddress, StoppingReason, StrategyConfig,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cleanup bookkeeping, present only while an instance is CLEANING.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CleanupState {
    #[default]
    Idle,
    Active {
        retry_count: u32,
        /// Positions that still have to be closed.
        targets: Vec<PositionAddress>,
        last_attempt: Option<DateTime<Utc>>,
    },
}

impl CleanupState {
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            CleanupState::Idle => None,
            CleanupState::Active { retry_count, .. } => Some(*retry_count),
        }
    }
}

/// Rolling dynamic-recreation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicSwitch {
    pub enabled: bool,
    pub last_benchmark_yield: Option<Decimal>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for DynamicSwitch {
    fn default() -> Self {
        Self {
            enabled: true,
            last_benchmark_yield: None,
            last_update: None,
        }
    }
}

/// Mutable state of one strategy instance.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub config: StrategyConfig,
    pub phase: Phase,
    pub phase_entered_at: Instant,
    pub position_addresses: Vec<PositionAddress>,
    pub position_range: Option<BinRange>,
    pub current_active_index: Option<i32>,
    pub stopping_reason: Option<StoppingReason>,
    pub cleanup: CleanupState,
    pub dynamic_switch: DynamicSwitch,
    pub has_been_created: bool,
    /// The monitoring timer should be running.
    pub is_active: bool,
    pub is_paused: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_tick_at: Option<Instant>,
    pub tick_count: u64,
    pub creation_attempts: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Amount deposited into the current positions.
    pub deposited: Decimal,
    pub last_error: Option<String>,
}

impl InstanceState {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            phase: Phase::Created,
            phase_entered_at: Instant::now(),
            position_addresses: Vec::new(),
            position_range: None,
            current_active_index: None,
            stopping_reason: None,
            cleanup: CleanupState::Idle,
            dynamic_switch: DynamicSwitch::default(),
            has_been_created: false,
            is_active: false,
            is_paused: false,
            last_tick: None,
            last_tick_at: None,
            tick_count: 0,
            creation_attempts: 0,
            opened_at: None,
            deposited: Decimal::ZERO,
            last_error: None,
        }
    }

    pub fn is_in_range(&self) -> bool {
        match (self.position_range, self.current_active_index) {
            (Some(range), Some(index)) => range.contains(index),
            _ => false,
        }
    }

    /// The user stopped the instance; nothing new may be opened for it.
    pub fn stopped_by_user(&self) -> bool {
        !self.is_active && self.stopping_reason == Some(StoppingReason::UserStop)
    }

    /// Moves to `to`, logging and broadcasting the change.
    pub fn transition(&mut self, instance: &InstanceId, to: Phase, events: &EventBus) {
        let from = self.phase;
        if from == to {
            return;
        }
        self.phase = to;
        self.phase_entered_at = Instant::now();

        if to == Phase::Error {
            error!(
                instance = %instance,
                from = %from,
                error = self.last_error.as_deref().unwrap_or("unknown"),
                "Instance entered ERROR"
            );
        } else {
            info!(instance = %instance, from = %from, to = %to, reason = ?self.stopping_reason, "Phase changed");
        }
        events.publish(
            instance,
            EventData::PhaseChanged {
                from,
                to,
                reason: self.stopping_reason,
            },
        );
    }

    /// Forgets the current positions.
    pub fn clear_positions(&mut self) {
        self.position_addresses.clear();
        self.position_range = None;
        self.opened_at = None;
        self.deposited = Decimal::ZERO;
    }

    pub fn status(&self, instance: &InstanceId) -> InstanceStatus {
        InstanceStatus {
            instance_id: instance.clone(),
            phase: self.phase,
            is_active: self.is_active,
            is_paused: self.is_paused,
            last_tick: self.last_tick,
            stopping_reason: self.stopping_reason,
            position_range: self.position_range,
            is_in_range: self.is_in_range(),
            position_addresses: self.position_addresses.clone(),
            current_active_index: self.current_active_index,
            tick_count: self.tick_count,
            dynamic_recreation_enabled: self.dynamic_switch.enabled,
            last_error: self.last_error.clone(),
        }
    }
}

/// Externally visible status of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub phase: Phase,
    pub is_active: bool,
    pub is_paused: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub stopping_reason: Option<StoppingReason>,
    pub position_range: Option<BinRange>,
    pub is_in_range: bool,
    pub position_addresses: Vec<PositionAddress>,
    pub current_active_index: Option<i32>,
    pub tick_count: u64,
    pub dynamic_recreation_enabled: bool,
    pub last_error: Option<String>,
}

/// What the watchdog reads about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDiagnostics {
    pub instance_id: InstanceId,
    pub phase: Phase,
    pub stopping_reason: Option<StoppingReason>,
    pub is_active: bool,
    pub is_paused: bool,
    pub time_in_phase: Duration,
    pub since_last_tick: Option<Duration>,
    pub monitoring_interval: Duration,
    pub timer_running: bool,
    pub tick_in_flight: bool,
    pub recreation_lock_held_for: Option<Duration>,
    pub swap_lock_held_for: Option<Duration>,
    pub cleanup_retry_count: Option<u32>,
}

/// Resource totals across all instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub instances: usize,
    pub running_timers: usize,
    pub cached_snapshots: usize,
    pub stop_loss_windows: usize,
    pub recreation_trackers: usize,
    pub held_locks: usize,
}

pub(crate) struct TimerHandle {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl TimerHandle {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

/// Everything the orchestrator keeps for one instance.
pub(crate) struct InstanceSlot {
    pub id: InstanceId,
    pub state: Mutex<InstanceState>,
    pub tick_running: AtomicBool,
    pub creating: AtomicBool,
    timer: SyncMutex<Option<TimerHandle>>,
    pub recreation_lock: InstanceLock,
    pub swap_lock: InstanceLock,
    /// Token precision by mint.
    pub decimals: RwLock<HashMap<String, u8>>,
}

impl InstanceSlot {
    pub fn new(id: InstanceId, config: StrategyConfig, lock_staleness: Duration) -> Self {
        Self {
            id,
            state: Mutex::new(InstanceState::new(config)),
            tick_running: AtomicBool::new(false),
            creating: AtomicBool::new(false),
            timer: SyncMutex::new(None),
            recreation_lock: InstanceLock::new(LockKind::Recreation, lock_staleness),
            swap_lock: InstanceLock::new(LockKind::Swap, lock_staleness),
            decimals: RwLock::new(HashMap::new()),
        }
    }

    fn timer(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timer_running(&self) -> bool {
        self.timer().as_ref().is_some_and(TimerHandle::is_running)
    }

    /// Installs a timer built by `spawn` unless one is already running.
    pub fn install_timer(&self, spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>) -> bool {
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(TimerHandle::is_running) {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = spawn(cancel.clone());
        *timer = Some(TimerHandle { cancel, handle });
        true
    }

    /// Cancels the timer. A tick in flight finishes; no further tick starts.
    pub fn cancel_timer(&self) -> bool {
        match self.timer().take() {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn held_locks(&self) -> usize {
        usize::from(self.recreation_lock.is_held()) + usize::from(self.swap_lock.is_held())
    }
}

/// Raised flag that lowers itself on drop.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// Raises `flag`, or returns `None` if it was already raised.
    pub fn try_raise(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_in_range_is_derived() {
        let mut state = InstanceState::new(StrategyConfig::new("p", dec!(1)));
        assert!(!state.is_in_range());

        state.position_range = Some(BinRange::new(10, 20).unwrap());
        state.current_active_index = Some(20);
        assert!(state.is_in_range());
        state.current_active_index = Some(21);
        assert!(!state.is_in_range());
    }

    #[tokio::test]
    async fn test_transition_publishes_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = InstanceId::from("i-1");
        let mut state = InstanceState::new(StrategyConfig::new("p", dec!(1)));

        state.transition(&id, Phase::Creating, &bus);
        state.transition(&id, Phase::Creating, &bus);
        state.transition(&id, Phase::Monitoring, &bus);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.data,
            EventData::PhaseChanged {
                from: Phase::Created,
                to: Phase::Creating,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.data,
            EventData::PhaseChanged {
                to: Phase::Monitoring,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flag_guard() {
        let flag = AtomicBool::new(false);
        let guard = FlagGuard::try_raise(&flag).unwrap();
        assert!(FlagGuard::try_raise(&flag).is_none());
        drop(guard);
        assert!(FlagGuard::try_raise(&flag).is_some());
    }
}
