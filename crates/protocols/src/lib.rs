//! Collaborator contracts the keeper drives.
//!
//! The keeper never talks to a chain directly. Everything it needs from the
//! outside world goes through the traits below:
//! - [`PositionManager`] opens and closes positions
//! - [`RangeProvider`] reads the active bin and pool metadata
//! - [`SwapRouter`] swaps residual balances
//! - [`BalanceProvider`] reads wallet balances and token precision
//! - [`GasOptimizer`] prepares transaction priority (best-effort)
//! - [`AnalyticsCollector`] produces market snapshots
//!
//! [`paper::PaperVenue`] implements all of them in memory.

/// Protocol error type.
pub mod error;
/// In-memory venue for dry runs and tests.
pub mod paper;
/// Prelude module for convenient imports.
pub mod prelude;
/// Request and receipt types.
pub mod types;

use async_trait::async_trait;
use lp_keeper_domain::{BinRange, InstanceId, MarketSnapshot, OperationClass, PositionAddress};
use rust_decimal::Decimal;

pub use error::{ProtocolError, ProtocolResult};
pub use paper::{PAPER_TOKEN_A, PAPER_TOKEN_B, PaperPosition, PaperVenue};
pub use types::{CloseReceipt, OpenedPosition, PoolInfo, SnapshotRequest, SwapReceipt, SwapRequest};

#[async_trait]
pub trait PositionManager: Send + Sync {
    /// Opens a position covering `range`, funded with `amount` of token B.
    async fn open(&self, pool: &str, range: BinRange, amount: Decimal)
    -> ProtocolResult<OpenedPosition>;

    /// Closes a position, withdrawing liquidity and claiming yield.
    ///
    /// Fails with a not-found style error when the position no longer exists.
    async fn close(&self, address: &PositionAddress) -> ProtocolResult<CloseReceipt>;
}

#[async_trait]
pub trait RangeProvider: Send + Sync {
    async fn active_index(&self, pool: &str) -> ProtocolResult<i32>;

    async fn pool_info(&self, pool: &str) -> ProtocolResult<PoolInfo>;
}

#[async_trait]
pub trait SwapRouter: Send + Sync {
    /// Swaps `request.amount_atomic` of the input token.
    async fn swap(&self, request: &SwapRequest) -> ProtocolResult<SwapReceipt>;
}

#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Wallet balance of `mint`, in human units.
    async fn token_balance(&self, mint: &str) -> ProtocolResult<Decimal>;

    async fn token_decimals(&self, mint: &str) -> ProtocolResult<u8>;
}

#[async_trait]
pub trait GasOptimizer: Send + Sync {
    /// Tunes priority fees for the next transaction of `class`.
    async fn prepare(&self, class: OperationClass) -> ProtocolResult<()>;
}

#[async_trait]
pub trait AnalyticsCollector: Send + Sync {
    async fn snapshot(
        &self,
        instance: &InstanceId,
        request: &SnapshotRequest,
    ) -> ProtocolResult<MarketSnapshot>;

    async fn update_tracked_positions(
        &self,
        instance: &InstanceId,
        positions: &[PositionAddress],
    ) -> ProtocolResult<()>;

    /// Drops whatever the collector keeps for `instance`.
    async fn release(&self, instance: &InstanceId);
}
