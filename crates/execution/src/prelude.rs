//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types from the crate.
//!
//! # Example
//!
//! ```rust
//! use lp_keeper_execution::prelude::*;
//! ```

// Errors
pub use crate::error::{ExecutionError, ExecutionResult};

// Events
pub use crate::events::{EventBus, EventData, LifecycleEvent};

// Locks
pub use crate::locks::{InstanceLock, LockKind};

// Market data
pub use crate::market_data::{MarketDataCollector, MarketDataConfig};

// Orchestrator
pub use crate::orchestrator::{
    CleanupState, InstanceDiagnostics, InstanceStatus, OrchestratorConfig, OrchestratorDeps,
    PositionLifecycleOrchestrator, RecreationOutcome, ResourceCounts, StopLossOutcome, TickBranch,
};

// Decisions
pub use crate::recreation::{
    RecreationDecision, RecreationDecisionModule, RecreationKind, RecreationVerdict,
};
pub use crate::stop_loss::{
    StopLossAction, StopLossConfig, StopLossDecision, StopLossDecisionModule,
};

// Retry
pub use crate::retry::{FailureClass, RetryExecutor, RetryOutcome, RetryPolicy};

// Watchdog
pub use crate::watchdog::{
    ForceCleanupResult, HealthIssue, HealthReport, HealthWatchdog, HealthWatchdogConfig,
};
