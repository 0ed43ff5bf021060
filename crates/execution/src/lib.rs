//! Position lifecycle engine.
//!
//! This crate drives strategy instances through their lifecycle:
//! - Creating positions around the active bin
//! - Monitoring each instance on its own timer
//! - Recreating positions when the price leaves the range
//! - Exiting on stop-loss decisions
//! - Cleaning up after partial failures
//! - Watching instance health and reclaiming leaked resources

/// Prelude module for convenient imports.
pub mod prelude;

/// Execution error type.
pub mod error;
/// Lifecycle event stream.
pub mod events;
/// Per-instance operation locks.
pub mod locks;
/// Per-tick market snapshot collection.
pub mod market_data;
/// Lifecycle orchestrator.
pub mod orchestrator;
/// Recreation decisions.
pub mod recreation;
/// Retry with failure classification.
pub mod retry;
/// Stop-loss decisions.
pub mod stop_loss;
/// Health watchdog.
pub mod watchdog;

pub use error::{ExecutionError, ExecutionResult};
pub use orchestrator::{OrchestratorConfig, OrchestratorDeps, PositionLifecycleOrchestrator};
