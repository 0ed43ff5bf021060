//! Prelude module for convenient imports.
//!
//! ```rust
//! use lp_keeper_protocols::prelude::*;
//! ```

pub use crate::error::{ProtocolError, ProtocolResult};
pub use crate::paper::{PAPER_TOKEN_A, PAPER_TOKEN_B, PaperPosition, PaperVenue};
pub use crate::types::{
    CloseReceipt, OpenedPosition, PoolInfo, SnapshotRequest, SwapReceipt, SwapRequest,
};
pub use crate::{
    AnalyticsCollector, BalanceProvider, GasOptimizer, PositionManager, RangeProvider, SwapRouter,
};
