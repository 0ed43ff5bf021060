//! Per-cycle market snapshots.
//!
//! The collector asks the analytics collaborator at most once per monitoring
//! tick and caches the result by tick id. While a yield extraction runs for an
//! instance, analytics figures are in flux, so the collector serves the
//! cached snapshot (or a price-only one) flagged as simplified instead.

use crate::error::{ExecutionError, ExecutionResult};
use lp_keeper_domain::{InstanceId, MarketSnapshot};
use lp_keeper_protocols::{AnalyticsCollector, ProtocolError, RangeProvider, SnapshotRequest};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Configuration for the market data collector.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Upper bound on a single analytics call.
    pub analytics_timeout: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            analytics_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    tick_id: u64,
    snapshot: MarketSnapshot,
}

/// Instances with a yield extraction in flight.
#[derive(Debug, Default)]
pub struct YieldExtractionTracker {
    active: Mutex<HashSet<InstanceId>>,
}

impl YieldExtractionTracker {
    /// Marks an extraction as running until the returned guard drops.
    pub fn begin(self: &Arc<Self>, instance: &InstanceId) -> YieldExtractionGuard {
        self.lock().insert(instance.clone());
        YieldExtractionGuard {
            tracker: Arc::clone(self),
            instance: instance.clone(),
        }
    }

    pub fn is_active(&self, instance: &InstanceId) -> bool {
        self.lock().contains(instance)
    }

    fn clear(&self, instance: &InstanceId) {
        self.lock().remove(instance);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<InstanceId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct YieldExtractionGuard {
    tracker: Arc<YieldExtractionTracker>,
    instance: InstanceId,
}

impl Drop for YieldExtractionGuard {
    fn drop(&mut self) {
        self.tracker.clear(&self.instance);
    }
}

/// Builds one consistent snapshot per instance per tick.
pub struct MarketDataCollector {
    analytics: Arc<dyn AnalyticsCollector>,
    ranges: Arc<dyn RangeProvider>,
    config: MarketDataConfig,
    cache: RwLock<HashMap<InstanceId, CachedSnapshot>>,
    extractions: Arc<YieldExtractionTracker>,
}

impl MarketDataCollector {
    pub fn new(
        analytics: Arc<dyn AnalyticsCollector>,
        ranges: Arc<dyn RangeProvider>,
        config: MarketDataConfig,
    ) -> Self {
        Self {
            analytics,
            ranges,
            config,
            cache: RwLock::new(HashMap::new()),
            extractions: Arc::new(YieldExtractionTracker::default()),
        }
    }

    /// Marks a yield extraction as running for `instance`.
    pub fn begin_yield_extraction(&self, instance: &InstanceId) -> YieldExtractionGuard {
        self.extractions.begin(instance)
    }

    /// Returns the snapshot for `tick_id`, calling analytics only if this tick
    /// has none cached yet.
    ///
    /// # Errors
    /// Propagates analytics and range-provider failures; a timed-out analytics
    /// call surfaces as a network error.
    pub async fn collect(
        &self,
        instance: &InstanceId,
        tick_id: u64,
        request: &SnapshotRequest,
    ) -> ExecutionResult<MarketSnapshot> {
        if self.extractions.is_active(instance) {
            return self.simplified(instance, request).await;
        }

        if let Some(cached) = self.cache.read().await.get(instance)
            && cached.tick_id == tick_id
        {
            return Ok(cached.snapshot.clone());
        }

        let snapshot = tokio::time::timeout(
            self.config.analytics_timeout,
            self.analytics.snapshot(instance, request),
        )
        .await
        .map_err(|_| {
            ExecutionError::Protocol(ProtocolError::Network(
                "analytics snapshot timed out".to_string(),
            ))
        })??;

        self.cache.write().await.insert(
            instance.clone(),
            CachedSnapshot {
                tick_id,
                snapshot: snapshot.clone(),
            },
        );
        Ok(snapshot)
    }

    async fn simplified(
        &self,
        instance: &InstanceId,
        request: &SnapshotRequest,
    ) -> ExecutionResult<MarketSnapshot> {
        if let Some(cached) = self.cache.read().await.get(instance) {
            debug!(instance = %instance, "Yield extraction running, reusing cached snapshot");
            return Ok(cached.snapshot.clone().into_simplified());
        }

        debug!(instance = %instance, "Yield extraction running, building price-only snapshot");
        let info = self.ranges.pool_info(&request.pool).await?;
        Ok(MarketSnapshot::simplified(
            info.active_price,
            info.active_index,
            request.bounds,
        ))
    }

    /// Drops everything held for `instance`.
    pub async fn release(&self, instance: &InstanceId) {
        self.cache.write().await.remove(instance);
        self.extractions.clear(instance);
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lp_keeper_domain::BinRange;
    use lp_keeper_protocols::PaperVenue;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperVenue>, MarketDataCollector) {
        let venue = Arc::new(PaperVenue::new("pool-1", 15, dec!(1.25)));
        let collector = MarketDataCollector::new(
            venue.clone(),
            venue.clone(),
            MarketDataConfig::default(),
        );
        (venue, collector)
    }

    fn request() -> SnapshotRequest {
        SnapshotRequest {
            pool: "pool-1".to_string(),
            positions: vec![],
            bounds: Some(BinRange::new(10, 20).unwrap()),
            deposited: dec!(100),
            opened_at: None,
        }
    }

    #[tokio::test]
    async fn test_one_analytics_call_per_tick() {
        let (venue, collector) = setup();
        let id = InstanceId::from("i-1");

        collector.collect(&id, 1, &request()).await.unwrap();
        collector.collect(&id, 1, &request()).await.unwrap();
        assert_eq!(venue.analytics_calls().await, 1);

        collector.collect(&id, 2, &request()).await.unwrap();
        assert_eq!(venue.analytics_calls().await, 2);
        assert_eq!(collector.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_extraction_serves_simplified_snapshot() {
        let (venue, collector) = setup();
        let id = InstanceId::from("i-1");

        {
            let _guard = collector.begin_yield_extraction(&id);
            let snapshot = collector.collect(&id, 1, &request()).await.unwrap();
            assert!(snapshot.simplified);
            assert_eq!(snapshot.price, dec!(1.25));
            assert_eq!(snapshot.net_pnl, Decimal::ZERO);
            assert_eq!(venue.analytics_calls().await, 0);
        }

        collector.collect(&id, 2, &request()).await.unwrap();
        let _guard = collector.begin_yield_extraction(&id);
        let cached = collector.collect(&id, 3, &request()).await.unwrap();
        assert!(cached.simplified);
        assert_eq!(venue.analytics_calls().await, 1);
    }

    #[tokio::test]
    async fn test_release_clears_cache() {
        let (_venue, collector) = setup();
        let id = InstanceId::from("i-1");
        collector.collect(&id, 1, &request()).await.unwrap();
        collector.release(&id).await;
        assert_eq!(collector.cached_count().await, 0);
    }
}
