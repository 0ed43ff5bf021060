//! In-memory venue.
//!
//! Implements every collaborator trait against a scripted pool so the keeper
//! can run in dry-run mode and so tests can drive exact failure sequences.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{
    CloseReceipt, OpenedPosition, PoolInfo, SnapshotRequest, SwapReceipt, SwapRequest,
};
use crate::{
    AnalyticsCollector, BalanceProvider, GasOptimizer, PositionManager, RangeProvider, SwapRouter,
};
use async_trait::async_trait;
use chrono::Utc;
use lp_keeper_domain::{
    BinRange, InstanceId, MarketSnapshot, OperationClass, PositionAddress, from_atomic, to_atomic,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Base token mint used by the paper pool.
pub const PAPER_TOKEN_A: &str = "PAPER_A";
/// Quote token mint used by the paper pool.
pub const PAPER_TOKEN_B: &str = "PAPER_B";

/// A position held by the paper venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperPosition {
    pub pool: String,
    pub range: BinRange,
    pub amount: Decimal,
}

#[derive(Debug, Default)]
struct VenueState {
    active_index: i32,
    price: Decimal,
    balances: HashMap<String, Decimal>,
    decimals: HashMap<String, u8>,
    positions: HashMap<PositionAddress, PaperPosition>,
    next_position: u64,
    next_signature: u64,

    open_calls: u32,
    close_calls: u32,
    analytics_calls: u32,
    gas_calls: Vec<OperationClass>,
    swaps: Vec<SwapRequest>,
    tracked: HashMap<InstanceId, Vec<PositionAddress>>,

    open_failures: HashMap<u32, ProtocolError>,
    close_failures: HashMap<PositionAddress, VecDeque<ProtocolError>>,
    sticky_close_failures: HashMap<PositionAddress, ProtocolError>,
    swap_failures: VecDeque<ProtocolError>,
    gas_failure: Option<ProtocolError>,

    net_pnl_pct: Decimal,
    price_change_pct: Option<Decimal>,
    yield_rate_pct: Option<Decimal>,
    benchmark_yield_pct: Option<Decimal>,
    pending_yield: Decimal,
}

impl VenueState {
    fn signature(&mut self) -> String {
        self.next_signature += 1;
        format!("paper-sig-{}", self.next_signature)
    }
}

/// Scriptable in-memory pool, wallet, router and analytics source.
pub struct PaperVenue {
    pool: String,
    bin_step_bps: u16,
    state: Mutex<VenueState>,
    latency: Mutex<Duration>,
}

impl PaperVenue {
    /// Creates a venue for `pool` with the active bin at `active_index`.
    pub fn new(pool: impl Into<String>, active_index: i32, price: Decimal) -> Self {
        let mut decimals = HashMap::new();
        decimals.insert(PAPER_TOKEN_A.to_string(), 9);
        decimals.insert(PAPER_TOKEN_B.to_string(), 6);

        Self {
            pool: pool.into(),
            bin_step_bps: 25,
            state: Mutex::new(VenueState {
                active_index,
                price,
                decimals,
                ..Default::default()
            }),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_pool(&self, pool: &str) -> ProtocolResult<()> {
        if pool == self.pool {
            Ok(())
        } else {
            Err(ProtocolError::PoolUnavailable(pool.to_string()))
        }
    }

    // Scripting

    pub async fn set_active_index(&self, index: i32) {
        self.state.lock().await.active_index = index;
    }

    pub async fn set_price(&self, price: Decimal) {
        self.state.lock().await.price = price;
    }

    pub async fn set_balance(&self, mint: &str, amount: Decimal) {
        self.state
            .lock()
            .await
            .balances
            .insert(mint.to_string(), amount);
    }

    pub async fn set_net_pnl_pct(&self, pct: Decimal) {
        self.state.lock().await.net_pnl_pct = pct;
    }

    pub async fn set_price_change_pct(&self, pct: Option<Decimal>) {
        self.state.lock().await.price_change_pct = pct;
    }

    pub async fn set_yield_rate_pct(&self, pct: Option<Decimal>) {
        self.state.lock().await.yield_rate_pct = pct;
    }

    pub async fn set_benchmark_yield_pct(&self, pct: Option<Decimal>) {
        self.state.lock().await.benchmark_yield_pct = pct;
    }

    pub async fn set_pending_yield(&self, amount: Decimal) {
        self.state.lock().await.pending_yield = amount;
    }

    /// Delays every collaborator call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }

    /// Makes the `ordinal`-th open call (1-based, counted over the venue's
    /// lifetime) fail with `error`.
    pub async fn fail_open_call(&self, ordinal: u32, error: ProtocolError) {
        self.state.lock().await.open_failures.insert(ordinal, error);
    }

    /// Queues `error` for the next close call on `address`.
    pub async fn fail_next_close(&self, address: &PositionAddress, error: ProtocolError) {
        self.state
            .lock()
            .await
            .close_failures
            .entry(address.clone())
            .or_default()
            .push_back(error);
    }

    /// Makes every close call on `address` fail until cleared.
    pub async fn fail_close_always(&self, address: &PositionAddress, error: ProtocolError) {
        self.state
            .lock()
            .await
            .sticky_close_failures
            .insert(address.clone(), error);
    }

    pub async fn clear_close_failures(&self, address: &PositionAddress) {
        let mut state = self.state.lock().await;
        state.close_failures.remove(address);
        state.sticky_close_failures.remove(address);
    }

    pub async fn fail_next_swap(&self, error: ProtocolError) {
        self.state.lock().await.swap_failures.push_back(error);
    }

    pub async fn fail_gas(&self, error: Option<ProtocolError>) {
        self.state.lock().await.gas_failure = error;
    }

    /// Drops a position behind the keeper's back, as if closed elsewhere.
    pub async fn remove_position(&self, address: &PositionAddress) -> Option<PaperPosition> {
        self.state.lock().await.positions.remove(address)
    }

    // Inspection

    pub async fn positions(&self) -> HashMap<PositionAddress, PaperPosition> {
        self.state.lock().await.positions.clone()
    }

    pub async fn balance(&self, mint: &str) -> Decimal {
        self.state
            .lock()
            .await
            .balances
            .get(mint)
            .copied()
            .unwrap_or_default()
    }

    pub async fn open_calls(&self) -> u32 {
        self.state.lock().await.open_calls
    }

    pub async fn close_calls(&self) -> u32 {
        self.state.lock().await.close_calls
    }

    pub async fn analytics_calls(&self) -> u32 {
        self.state.lock().await.analytics_calls
    }

    pub async fn swaps(&self) -> Vec<SwapRequest> {
        self.state.lock().await.swaps.clone()
    }

    pub async fn gas_calls(&self) -> Vec<OperationClass> {
        self.state.lock().await.gas_calls.clone()
    }

    pub async fn tracked_positions(&self, instance: &InstanceId) -> Option<Vec<PositionAddress>> {
        self.state.lock().await.tracked.get(instance).cloned()
    }
}

#[async_trait]
impl PositionManager for PaperVenue {
    async fn open(
        &self,
        pool: &str,
        range: BinRange,
        amount: Decimal,
    ) -> ProtocolResult<OpenedPosition> {
        self.simulate_latency().await;
        self.check_pool(pool)?;

        let mut state = self.state.lock().await;
        state.open_calls += 1;
        let ordinal = state.open_calls;
        if let Some(error) = state.open_failures.remove(&ordinal) {
            return Err(error);
        }

        state.next_position += 1;
        let address = PositionAddress::new(format!("paper-pos-{}", state.next_position));
        state.positions.insert(
            address.clone(),
            PaperPosition {
                pool: pool.to_string(),
                range,
                amount,
            },
        );
        let signature = state.signature();

        debug!(position = %address, range = %range, amount = %amount, "Paper position opened");
        Ok(OpenedPosition { address, signature })
    }

    async fn close(&self, address: &PositionAddress) -> ProtocolResult<CloseReceipt> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        state.close_calls += 1;
        if let Some(error) = state.sticky_close_failures.get(address) {
            return Err(error.clone());
        }
        if let Some(error) = state
            .close_failures
            .get_mut(address)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let Some(position) = state.positions.remove(address) else {
            return Err(ProtocolError::PositionNotFound(address.to_string()));
        };
        // Withdrawn liquidity lands in the wallet as quote token.
        *state
            .balances
            .entry(PAPER_TOKEN_B.to_string())
            .or_default() += position.amount;
        let signature = state.signature();

        debug!(position = %address, "Paper position closed");
        Ok(CloseReceipt { signature })
    }
}

#[async_trait]
impl RangeProvider for PaperVenue {
    async fn active_index(&self, pool: &str) -> ProtocolResult<i32> {
        self.simulate_latency().await;
        self.check_pool(pool)?;
        Ok(self.state.lock().await.active_index)
    }

    async fn pool_info(&self, pool: &str) -> ProtocolResult<PoolInfo> {
        self.simulate_latency().await;
        self.check_pool(pool)?;
        let state = self.state.lock().await;
        Ok(PoolInfo {
            address: self.pool.clone(),
            token_a: PAPER_TOKEN_A.to_string(),
            token_b: PAPER_TOKEN_B.to_string(),
            active_price: state.price,
            active_index: state.active_index,
            bin_step_bps: self.bin_step_bps,
        })
    }
}

#[async_trait]
impl SwapRouter for PaperVenue {
    async fn swap(&self, request: &SwapRequest) -> ProtocolResult<SwapReceipt> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        state.swaps.push(request.clone());
        if let Some(error) = state.swap_failures.pop_front() {
            return Err(error);
        }

        let decimals_in = state.decimals.get(&request.input_mint).copied().unwrap_or(9);
        let decimals_out = state
            .decimals
            .get(&request.output_mint)
            .copied()
            .unwrap_or(6);
        let amount_in = from_atomic(request.amount_atomic, decimals_in)
            .map_err(|e| ProtocolError::Rejected(e.to_string()))?;

        let available = state
            .balances
            .get(&request.input_mint)
            .copied()
            .unwrap_or_default();
        if available < amount_in {
            return Err(ProtocolError::InsufficientBalance(format!(
                "{} has {available}, needs {amount_in}",
                request.input_mint
            )));
        }

        let amount_out = if request.input_mint == PAPER_TOKEN_A {
            amount_in * state.price
        } else if state.price.is_zero() {
            Decimal::ZERO
        } else {
            amount_in / state.price
        };

        *state
            .balances
            .entry(request.input_mint.clone())
            .or_default() -= amount_in;
        *state
            .balances
            .entry(request.output_mint.clone())
            .or_default() += amount_out;

        let output_amount_atomic =
            to_atomic(amount_out, decimals_out).map_err(|e| ProtocolError::Rejected(e.to_string()))?;
        let signature = state.signature();
        Ok(SwapReceipt {
            output_amount_atomic,
            signature,
        })
    }
}

#[async_trait]
impl BalanceProvider for PaperVenue {
    async fn token_balance(&self, mint: &str) -> ProtocolResult<Decimal> {
        self.simulate_latency().await;
        Ok(self.balance(mint).await)
    }

    async fn token_decimals(&self, mint: &str) -> ProtocolResult<u8> {
        self.state
            .lock()
            .await
            .decimals
            .get(mint)
            .copied()
            .ok_or_else(|| ProtocolError::AccountNotReady(format!("mint {mint}")))
    }
}

#[async_trait]
impl GasOptimizer for PaperVenue {
    async fn prepare(&self, class: OperationClass) -> ProtocolResult<()> {
        let mut state = self.state.lock().await;
        state.gas_calls.push(class);
        match &state.gas_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AnalyticsCollector for PaperVenue {
    async fn snapshot(
        &self,
        _instance: &InstanceId,
        request: &SnapshotRequest,
    ) -> ProtocolResult<MarketSnapshot> {
        self.simulate_latency().await;
        self.check_pool(&request.pool)?;

        let mut state = self.state.lock().await;
        state.analytics_calls += 1;

        let position_value: Decimal = request
            .positions
            .iter()
            .filter_map(|address| state.positions.get(address))
            .map(|position| position.amount)
            .sum();
        let net_pnl = request.deposited * state.net_pnl_pct / Decimal::ONE_HUNDRED;
        let holding_secs = request
            .opened_at
            .map(|opened| (Utc::now() - opened).num_seconds().max(0) as u64)
            .unwrap_or(0);

        Ok(MarketSnapshot {
            price: state.price,
            position_value,
            net_pnl,
            net_pnl_pct: state.net_pnl_pct,
            active_index: state.active_index,
            position_bounds: request.bounds,
            holding_secs,
            pending_yield: state.pending_yield,
            extracted_yield: Decimal::ZERO,
            price_change_pct: state.price_change_pct,
            yield_rate_pct: state.yield_rate_pct,
            benchmark_yield_pct: state.benchmark_yield_pct,
            simplified: false,
            captured_at: Utc::now(),
        })
    }

    async fn update_tracked_positions(
        &self,
        instance: &InstanceId,
        positions: &[PositionAddress],
    ) -> ProtocolResult<()> {
        self.state
            .lock()
            .await
            .tracked
            .insert(instance.clone(), positions.to_vec());
        Ok(())
    }

    async fn release(&self, instance: &InstanceId) {
        self.state.lock().await.tracked.remove(instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> PaperVenue {
        PaperVenue::new("pool-1", 15, dec!(1))
    }

    #[tokio::test]
    async fn test_open_and_close_position() {
        let venue = venue();
        let range = BinRange::new(10, 20).unwrap();
        let opened = venue.open("pool-1", range, dec!(100)).await.unwrap();
        assert_eq!(venue.positions().await.len(), 1);

        venue.close(&opened.address).await.unwrap();
        assert!(venue.positions().await.is_empty());
        assert_eq!(venue.balance(PAPER_TOKEN_B).await, dec!(100));

        let again = venue.close(&opened.address).await;
        assert!(matches!(again, Err(ProtocolError::PositionNotFound(_))));
    }

    #[tokio::test]
    async fn test_scripted_open_failure() {
        let venue = venue();
        venue
            .fail_open_call(2, ProtocolError::Rpc("node down".into()))
            .await;
        let range = BinRange::new(10, 20).unwrap();

        assert!(venue.open("pool-1", range, dec!(1)).await.is_ok());
        assert!(venue.open("pool-1", range, dec!(1)).await.is_err());
        assert!(venue.open("pool-1", range, dec!(1)).await.is_ok());
        assert_eq!(venue.open_calls().await, 3);
    }

    #[tokio::test]
    async fn test_close_failures_queue_then_succeed() {
        let venue = venue();
        let range = BinRange::new(10, 20).unwrap();
        let opened = venue.open("pool-1", range, dec!(1)).await.unwrap();
        venue
            .fail_next_close(&opened.address, ProtocolError::Network("reset".into()))
            .await;

        assert!(venue.close(&opened.address).await.is_err());
        assert!(venue.close(&opened.address).await.is_ok());
    }

    #[tokio::test]
    async fn test_swap_converts_at_price() {
        let venue = PaperVenue::new("pool-1", 0, dec!(2));
        venue.set_balance(PAPER_TOKEN_A, dec!(12.5)).await;

        let receipt = venue
            .swap(&SwapRequest {
                input_mint: PAPER_TOKEN_A.to_string(),
                output_mint: PAPER_TOKEN_B.to_string(),
                amount_atomic: 12_500_000_000,
                slippage_bps: 300,
            })
            .await
            .unwrap();

        assert_eq!(receipt.output_amount_atomic, 25_000_000);
        assert_eq!(venue.balance(PAPER_TOKEN_A).await, Decimal::ZERO);
        assert_eq!(venue.balance(PAPER_TOKEN_B).await, dec!(25));
    }

    #[tokio::test]
    async fn test_snapshot_reflects_script() {
        let venue = venue();
        venue.set_net_pnl_pct(dec!(-10)).await;
        let snapshot = venue
            .snapshot(
                &InstanceId::from("i-1"),
                &SnapshotRequest {
                    pool: "pool-1".to_string(),
                    positions: vec![],
                    bounds: Some(BinRange::new(10, 20).unwrap()),
                    deposited: dec!(200),
                    opened_at: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(snapshot.net_pnl, dec!(-20));
        assert!(snapshot.is_in_range());
        assert_eq!(venue.analytics_calls().await, 1);
    }
}
