//! CouponHub data layer.
//!
//! Query construction, caching, monitoring, and customer linking over a
//! schemaless document store.
//!
//! # Modules
//!
//! - [`store`] - Document store seam and the in-memory implementation
//! - [`query`] - Index-aware compound queries and batched ID lookups
//! - [`cache`] - Two-tier TTL cache (memory + persisted storage)
//! - [`monitor`] - Query timing, cache hits, and error tracking
//! - [`coupons`] - Cached coupon and customer queries
//! - [`linking`] - Customer lookup, business discovery, and link repair
//! - [`migration`] - Phone normalization backfill
//! - [`config`] - Environment configuration
//!
//! # Construction
//!
//! Nothing here is global. Build a [`DataLayer`] once at startup and share it;
//! call [`DataLayer::shutdown`] when done to log a final performance summary.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod clock;
pub mod config;
pub mod coupons;
pub mod error;
pub mod linking;
pub mod migration;
pub mod monitor;
pub mod query;
pub mod store;

use std::sync::Arc;

use tracing::info;

pub use error::{DataError, Result};

use cache::{CacheManager, FileStorage, MemoryStorage, PersistentStorage, StorageError};
use clock::{Clock, SystemClock};
use config::DataConfig;
use coupons::OptimizedCouponService;
use linking::{BusinessDiscovery, CustomerLookup, LinkVerifier};
use monitor::{PerformanceMonitor, PerformanceSummary};
use store::DocumentStore;

/// The data-layer services, wired to one store, cache, and monitor.
#[derive(Clone)]
pub struct DataLayer {
    inner: Arc<DataLayerInner>,
}

struct DataLayerInner {
    config: DataConfig,
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheManager>,
    monitor: Arc<PerformanceMonitor>,
    clock: Arc<dyn Clock>,
    coupons: OptimizedCouponService,
    lookup: CustomerLookup,
    discovery: BusinessDiscovery,
    links: LinkVerifier,
}

impl DataLayer {
    /// Wire the services from explicit parts.
    #[must_use]
    pub fn new(
        config: DataConfig,
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn PersistentStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(CacheManager::new(storage, Arc::clone(&clock), &config.cache));
        let monitor = Arc::new(PerformanceMonitor::new(&config.monitor));

        let coupons = OptimizedCouponService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            Arc::clone(&clock),
        );
        let lookup = CustomerLookup::new(Arc::clone(&store));
        let discovery = BusinessDiscovery::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
            config.discovery.clone(),
        );
        let links = LinkVerifier::new(Arc::clone(&store), Arc::clone(&clock));

        Self {
            inner: Arc::new(DataLayerInner {
                config,
                store,
                cache,
                monitor,
                clock,
                coupons,
                lookup,
                discovery,
                links,
            }),
        }
    }

    /// Wire the services using the configured persisted storage and the
    /// system clock.
    ///
    /// With `cache.storage_path` set, the persisted tier is a JSON file;
    /// otherwise it is process memory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the storage file exists but cannot be read.
    pub fn open(
        config: DataConfig,
        store: Arc<dyn DocumentStore>,
    ) -> std::result::Result<Self, StorageError> {
        let quota = config.cache.storage_quota_bytes;
        let storage: Arc<dyn PersistentStorage> = match &config.cache.storage_path {
            Some(path) => Arc::new(FileStorage::open(path, Some(quota))?),
            None => Arc::new(MemoryStorage::with_quota(quota)),
        };
        Ok(Self::new(config, store, storage, Arc::new(SystemClock)))
    }

    #[must_use]
    pub fn config(&self) -> &DataConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    #[must_use]
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    #[must_use]
    pub fn coupons(&self) -> &OptimizedCouponService {
        &self.inner.coupons
    }

    #[must_use]
    pub fn lookup(&self) -> &CustomerLookup {
        &self.inner.lookup
    }

    #[must_use]
    pub fn discovery(&self) -> &BusinessDiscovery {
        &self.inner.discovery
    }

    #[must_use]
    pub fn links(&self) -> &LinkVerifier {
        &self.inner.links
    }

    /// Drop expired cache entries and log the performance summary.
    ///
    /// Returns the summary for callers that want to print it.
    pub fn shutdown(&self) -> PerformanceSummary {
        let purged = self.inner.cache.purge_expired();
        let summary = self.inner.monitor.get_performance_summary();
        info!(
            queries = summary.completed_queries,
            cache_hits = summary.cache_hits,
            errors = summary.errors,
            average_ms = summary.average_duration_ms,
            hit_rate = summary.cache_hit_rate,
            slow = summary.slow_queries.len(),
            purged,
            "Data layer shut down"
        );
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{InMemoryStore, collections};

    #[tokio::test]
    async fn test_services_share_cache_and_monitor() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(collections::CUSTOMERS, "c1", json!({"phone": "0832091122", "phone_normalized": "0832091122"}))
            .unwrap();

        let layer = DataLayer::new(
            DataConfig::default(),
            store,
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
        );

        layer.coupons().find_customer_by_phone_optimized("083 209 1122").await.unwrap();
        layer.coupons().find_customer_by_phone_optimized("083 209 1122").await.unwrap();

        assert_eq!(layer.cache().stats().memory_entries, 1);
        let summary = layer.shutdown();
        assert_eq!(summary.completed_queries, 1);
        assert_eq!(summary.cache_hits, 1);
    }

    #[test]
    fn test_open_with_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DataConfig::default();
        config.cache.storage_path = Some(dir.path().join("cache.json"));

        let layer = DataLayer::open(config, Arc::new(InMemoryStore::new())).unwrap();
        layer.cache().set_default("k", &1);
        assert!(dir.path().join("cache.json").exists());
    }
}
