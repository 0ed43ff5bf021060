//! Domain types for the liquidity position keeper.
//!
//! Everything in here is a plain value: bin ranges, strategy configuration,
//! lifecycle phases and the per-cycle market snapshot. Behaviour that talks to
//! a venue or owns mutable state lives in the execution crate.

/// Strategy configuration and partial updates.
pub mod config;
/// Instance and position identifiers.
pub mod entities;
/// Lifecycle enums shared across crates.
pub mod enums;
/// Domain error type.
pub mod error;
/// Market snapshot produced once per monitoring cycle.
pub mod snapshot;
/// Small value objects (ranges, amounts, price bands).
pub mod value_objects;

pub use config::{
    DynamicYieldConfig, LossRecoveryConfig, MarketOpportunityConfig, PriceGuard, PriceGuardMode,
    RecreationToggles, StrategyConfig, StrategyConfigPatch,
};
pub use entities::{InstanceId, PositionAddress};
pub use enums::{OperationClass, Phase, RangeDirection, StoppingReason, Urgency};
pub use error::{DomainError, DomainResult};
pub use snapshot::MarketSnapshot;
pub use value_objects::{BandViolation, BinRange, PriceBand, from_atomic, to_atomic};
