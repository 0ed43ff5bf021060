use chrono::{DateTime, Utc};
use lp_keeper_domain::{BinRange, PositionAddress};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Result of opening a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedPosition {
    /// Address of the new position account.
    pub address: PositionAddress,
    /// Transaction signature.
    pub signature: String,
}

/// Result of closing a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReceipt {
    /// Transaction signature.
    pub signature: String,
}

/// Static and live pool metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub address: String,
    /// Base token mint (side A).
    pub token_a: String,
    /// Quote token mint (side B).
    pub token_b: String,
    /// Price of token A in token B at the active bin.
    pub active_price: Decimal,
    pub active_index: i32,
    /// Price step between adjacent bins, in basis points.
    pub bin_step_bps: u16,
}

/// Parameters of a token swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub input_mint: String,
    pub output_mint: String,
    /// Input amount in atomic units.
    pub amount_atomic: u64,
    /// Slippage tolerance in basis points.
    pub slippage_bps: u16,
}

/// Result of a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    /// Output amount in atomic units.
    pub output_amount_atomic: u64,
    pub signature: String,
}

/// What the analytics collector needs to build a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub pool: String,
    pub positions: Vec<PositionAddress>,
    pub bounds: Option<BinRange>,
    /// Amount deposited into the current positions, in token B.
    pub deposited: Decimal,
    pub opened_at: Option<DateTime<Utc>>,
}
