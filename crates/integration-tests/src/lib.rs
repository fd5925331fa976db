//! Integration tests for CouponHub.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p couponhub-integration-tests
//! ```
//!
//! Everything runs against [`InMemoryStore`] with a [`ManualClock`], so no
//! external services are needed.
//!
//! # Test Categories
//!
//! - `coupon_queries` - Paging, caching, and invalidation through the data layer
//! - `link_repair` - Customer/user link verification and repair sweeps
//! - `business_discovery` - Business discovery across all sources
//! - `phone_migration` - Phone backfill and indexed phone lookup

use std::sync::Arc;

use serde_json::{Value, json};

use couponhub_data::DataLayer;
use couponhub_data::cache::{MemoryStorage, PersistentStorage};
use couponhub_data::clock::ManualClock;
use couponhub_data::config::DataConfig;
use couponhub_data::store::{InMemoryStore, collections};

/// 2024-06-01T00:00:00Z
pub const NOW_MILLIS: i64 = 1_717_200_000_000;

/// A data layer over an in-memory store with a controllable clock.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub layer: DataLayer,
}

impl TestContext {
    /// Fresh store, in-memory cache storage, clock at [`NOW_MILLIS`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Arc::new(InMemoryStore::new()), Arc::new(MemoryStorage::new()))
    }

    /// Build over an existing store and cache storage.
    #[must_use]
    pub fn with_parts(store: Arc<InMemoryStore>, storage: Arc<dyn PersistentStorage>) -> Self {
        let clock = ManualClock::new(NOW_MILLIS);
        let layer = DataLayer::new(
            DataConfig::default(),
            Arc::clone(&store) as _,
            storage,
            Arc::new(clock.clone()),
        );
        Self { store, clock, layer }
    }

    /// Insert a document, panicking on malformed input.
    pub fn seed(&self, collection: &str, id: &str, value: Value) {
        if let Err(e) = self.store.seed(collection, id, value) {
            panic!("seeding {collection}/{id}: {e}");
        }
    }

    pub fn seed_business(&self, id: &str, status: &str) {
        self.seed(
            collections::BUSINESSES,
            id,
            json!({"name": format!("Business {id}"), "status": status}),
        );
    }

    pub fn seed_customer(&self, id: &str, fields: Value) {
        self.seed(collections::CUSTOMERS, id, fields);
    }

    pub fn seed_user(&self, id: &str, fields: Value) {
        self.seed(collections::USERS, id, fields);
    }

    /// Active coupon for `business`, created on day `day` of May 2024.
    pub fn seed_coupon(&self, id: &str, business: &str, day: u32) {
        self.seed(
            collections::COUPONS,
            id,
            json!({
                "businessId": business,
                "title": format!("Coupon {id}"),
                "status": "active",
                "createdAt": format!("2024-05-{day:02}T00:00:00Z"),
            }),
        );
    }

    /// Field value of a stored document.
    #[must_use]
    pub fn field(&self, collection: &str, id: &str, field: &str) -> Option<Value> {
        self.store.document(collection, id).and_then(|doc| doc.field(field))
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
