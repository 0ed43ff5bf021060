//! Health watchdog.
//!
//! Sweeps every instance on its own cadence and flags:
//! - instances stuck in a transient phase
//! - running timers that stopped ticking, or that run for halted instances
//! - active instances that lost their timer
//! - locks held past the staleness ceiling
//! - instances in ERROR
//! - runaway decision-module state
//!
//! With `auto_force_cleanup` set, stuck and errored instances are torn down.

use crate::orchestrator::{InstanceDiagnostics, PositionLifecycleOrchestrator, ResourceCounts};
use chrono::{DateTime, Utc};
use lp_keeper_domain::{InstanceId, Phase, StoppingReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the health watchdog.
#[derive(Debug, Clone)]
pub struct HealthWatchdogConfig {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Time in a transient phase after which the instance counts as stuck.
    pub stuck_phase_threshold: Duration,
    /// A timer is stale after this many monitoring intervals without a tick.
    pub stale_tick_factor: u32,
    /// Observation windows beyond which the stop-loss module is purged.
    pub max_stop_loss_windows: usize,
    /// Tear down stuck and errored instances instead of only reporting them.
    pub auto_force_cleanup: bool,
}

impl Default for HealthWatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stuck_phase_threshold: Duration::from_secs(900), // 15 minutes
            stale_tick_factor: 3,
            max_stop_loss_windows: 500,
            auto_force_cleanup: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthIssue {
    StuckPhase {
        instance: InstanceId,
        phase: Phase,
        stuck_for: Duration,
    },
    StaleTimer {
        instance: InstanceId,
        since_last_tick: Duration,
    },
    LeakedTimer {
        instance: InstanceId,
        phase: Phase,
    },
    MissingTimer {
        instance: InstanceId,
    },
    StaleLock {
        instance: InstanceId,
        lock: &'static str,
        held_for: Duration,
    },
    ErrorPhase {
        instance: InstanceId,
    },
    WindowOverflow {
        windows: usize,
        limit: usize,
    },
}

impl HealthIssue {
    /// Issues that warrant tearing the instance down.
    fn cleanup_target(&self) -> Option<&InstanceId> {
        match self {
            HealthIssue::StuckPhase { instance, .. } | HealthIssue::ErrorPhase { instance } => {
                Some(instance)
            }
            _ => None,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub instances: usize,
    pub issues: Vec<HealthIssue>,
    pub counts: ResourceCounts,
    pub forced_cleanups: Vec<InstanceId>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// How a forced cleanup went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceCleanupResult {
    /// The orchestrator's normal delete succeeded.
    Deleted,
    /// Delete failed; resources were released directly.
    Released,
    NotFound,
}

pub struct HealthWatchdog {
    orchestrator: Arc<PositionLifecycleOrchestrator>,
    config: HealthWatchdogConfig,
}

impl HealthWatchdog {
    pub fn new(orchestrator: Arc<PositionLifecycleOrchestrator>, config: HealthWatchdogConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Inspects every instance once.
    pub async fn sweep(&self) -> HealthReport {
        let ids = self.orchestrator.instance_ids().await;
        let mut issues = Vec::new();

        for id in &ids {
            match self.orchestrator.diagnostics(id).await {
                Ok(diagnostics) => self.inspect(&diagnostics, &mut issues),
                Err(e) => debug!(instance = %id, error = %e, "Instance vanished during sweep"),
            }
        }

        let counts = self.orchestrator.resource_counts().await;
        if counts.stop_loss_windows > self.config.max_stop_loss_windows {
            issues.push(HealthIssue::WindowOverflow {
                windows: counts.stop_loss_windows,
                limit: self.config.max_stop_loss_windows,
            });
        }

        for issue in &issues {
            warn!(?issue, "Health issue detected");
        }

        let mut forced_cleanups = Vec::new();
        if self.config.auto_force_cleanup {
            for instance in issues.iter().filter_map(HealthIssue::cleanup_target) {
                if !forced_cleanups.contains(instance) {
                    self.force_cleanup(instance).await;
                    forced_cleanups.push(instance.clone());
                }
            }
            if issues
                .iter()
                .any(|issue| matches!(issue, HealthIssue::WindowOverflow { .. }))
            {
                let purged = self.orchestrator.stop_loss_module().purge_all().await;
                warn!(purged, "Stop-loss windows purged");
            }
        }

        HealthReport {
            checked_at: Utc::now(),
            instances: ids.len(),
            issues,
            counts,
            forced_cleanups,
        }
    }

    fn inspect(&self, d: &InstanceDiagnostics, issues: &mut Vec<HealthIssue>) {
        let id = &d.instance_id;

        if d.phase == Phase::Error {
            issues.push(HealthIssue::ErrorPhase {
                instance: id.clone(),
            });
        }

        let parked_by_user = !d.is_active && d.stopping_reason == Some(StoppingReason::UserStop);
        if d.phase.is_transient()
            && !parked_by_user
            && d.time_in_phase >= self.config.stuck_phase_threshold
        {
            issues.push(HealthIssue::StuckPhase {
                instance: id.clone(),
                phase: d.phase,
                stuck_for: d.time_in_phase,
            });
        }

        if d.timer_running && (d.phase.is_terminal() || !d.is_active) {
            issues.push(HealthIssue::LeakedTimer {
                instance: id.clone(),
                phase: d.phase,
            });
        }

        if d.is_active && !d.is_paused && !d.timer_running && !d.phase.is_terminal() {
            issues.push(HealthIssue::MissingTimer {
                instance: id.clone(),
            });
        }

        let stale_after = d.monitoring_interval * self.config.stale_tick_factor.max(1);
        if d.timer_running
            && d.is_active
            && !d.tick_in_flight
            && let Some(since) = d.since_last_tick
            && since > stale_after
        {
            issues.push(HealthIssue::StaleTimer {
                instance: id.clone(),
                since_last_tick: since,
            });
        }

        let staleness = self.orchestrator.config().lock_staleness;
        for (lock, held) in [
            ("recreation", d.recreation_lock_held_for),
            ("swap", d.swap_lock_held_for),
        ] {
            if let Some(held_for) = held
                && held_for > staleness
            {
                issues.push(HealthIssue::StaleLock {
                    instance: id.clone(),
                    lock,
                    held_for,
                });
            }
        }
    }

    /// Tears an instance down: normal delete first, direct release if that
    /// fails.
    pub async fn force_cleanup(&self, id: &InstanceId) -> ForceCleanupResult {
        match self.orchestrator.delete(id).await {
            Ok(()) => {
                info!(instance = %id, "Instance force-cleaned");
                ForceCleanupResult::Deleted
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "Delete failed, releasing resources directly");
                let existed = self.orchestrator.release_resources(id).await;
                self.orchestrator.stop_loss_module().purge(id).await;
                self.orchestrator.recreation_module().reset(id).await;
                if existed {
                    ForceCleanupResult::Released
                } else {
                    ForceCleanupResult::NotFound
                }
            }
        }
    }

    /// Sweeps until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            auto_force_cleanup = self.config.auto_force_cleanup,
            "Starting health watchdog"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.sweep().await;
            if report.is_healthy() {
                debug!(instances = report.instances, "Health sweep clean");
            } else if !report.forced_cleanups.is_empty() {
                error!(
                    issues = report.issues.len(),
                    forced = report.forced_cleanups.len(),
                    "Health sweep forced cleanups"
                );
            }
        }

        info!("Health watchdog stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{OrchestratorConfig, OrchestratorDeps};
    use crate::retry::RetryPolicy;
    use lp_keeper_domain::StrategyConfig;
    use lp_keeper_protocols::{PaperVenue, ProtocolError};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperVenue>, Arc<PositionLifecycleOrchestrator>) {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1)));
        let config = OrchestratorConfig {
            close_retry: RetryPolicy::close_position().with_delay(Duration::ZERO),
            swap_retry: RetryPolicy::swap().with_delay(Duration::ZERO),
            ..Default::default()
        };
        let orchestrator =
            PositionLifecycleOrchestrator::new(OrchestratorDeps::from_venue(venue.clone()), config);
        (venue, orchestrator)
    }

    fn strategy() -> StrategyConfig {
        let mut config = StrategyConfig::new("pool-1", dec!(100));
        config.range_width_bins = 10;
        config.monitoring_interval_secs = 3600;
        config
    }

    #[tokio::test]
    async fn test_healthy_instance() {
        let (_venue, orchestrator) = setup();
        orchestrator
            .execute(&InstanceId::from("i-1"), strategy())
            .await
            .unwrap();

        let watchdog = HealthWatchdog::new(orchestrator, HealthWatchdogConfig::default());
        let report = watchdog.sweep().await;
        assert!(report.is_healthy(), "{:?}", report.issues);
        assert_eq!(report.instances, 1);
        assert_eq!(report.counts.running_timers, 1);
    }

    #[tokio::test]
    async fn test_error_instance_is_force_cleaned() {
        let (venue, orchestrator) = setup();
        let id = InstanceId::from("i-1");
        for ordinal in 1..=3 {
            venue
                .fail_open_call(ordinal, ProtocolError::Rejected("pool paused".into()))
                .await;
        }

        assert!(orchestrator.execute(&id, strategy()).await.is_err());
        assert!(orchestrator.run_cycle(&id).await.is_err());
        assert!(orchestrator.run_cycle(&id).await.is_err());
        assert_eq!(orchestrator.get_status(&id).await.unwrap().phase, Phase::Error);

        let watchdog = HealthWatchdog::new(
            orchestrator.clone(),
            HealthWatchdogConfig {
                auto_force_cleanup: true,
                ..Default::default()
            },
        );
        let report = watchdog.sweep().await;
        assert!(report.issues.contains(&HealthIssue::ErrorPhase {
            instance: id.clone()
        }));
        assert_eq!(report.forced_cleanups, vec![id.clone()]);
        assert!(orchestrator.instance_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_phase_detected() {
        let (venue, orchestrator) = setup();
        let id = InstanceId::from("i-1");
        venue
            .fail_open_call(1, ProtocolError::Network("reset".into()))
            .await;
        assert!(orchestrator.execute(&id, strategy()).await.is_err());

        let watchdog = HealthWatchdog::new(
            orchestrator,
            HealthWatchdogConfig {
                stuck_phase_threshold: Duration::ZERO,
                ..Default::default()
            },
        );
        let report = watchdog.sweep().await;
        assert!(report.issues.iter().any(|issue| matches!(
            issue,
            HealthIssue::StuckPhase {
                phase: Phase::Creating,
                ..
            }
        )));
        assert!(report.forced_cleanups.is_empty());
    }

    #[tokio::test]
    async fn test_user_stopped_cleanup_is_not_stuck() {
        let (venue, orchestrator) = setup();
        let id = InstanceId::from("i-1");
        venue
            .fail_open_call(2, ProtocolError::Rejected("bin array missing".into()))
            .await;
        let mut config = strategy();
        config.max_bins_per_position = 6;
        assert!(orchestrator.execute(&id, config).await.is_err());
        orchestrator.stop(&id).await.unwrap();
        assert_eq!(orchestrator.get_status(&id).await.unwrap().phase, Phase::Cleaning);

        let watchdog = HealthWatchdog::new(
            orchestrator,
            HealthWatchdogConfig {
                stuck_phase_threshold: Duration::ZERO,
                ..Default::default()
            },
        );
        let report = watchdog.sweep().await;
        assert!(report.is_healthy(), "{:?}", report.issues);
    }

    #[tokio::test]
    async fn test_force_cleanup_unknown_instance() {
        let (_venue, orchestrator) = setup();
        let watchdog = HealthWatchdog::new(orchestrator, HealthWatchdogConfig::default());
        assert_eq!(
            watchdog.force_cleanup(&InstanceId::from("missing")).await,
            ForceCleanupResult::NotFound
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_venue, orchestrator) = setup();
        let watchdog = Arc::new(HealthWatchdog::new(
            orchestrator,
            HealthWatchdogConfig {
                sweep_interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();
        let handle = watchdog.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
