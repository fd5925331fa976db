//! Cached coupon queries.
//!
//! [`OptimizedCouponService`] sits in front of the document store: every
//! lookup checks the [`CacheManager`] first, store queries are built with
//! [`build_compound_query`] and timed through the [`PerformanceMonitor`].
//!
//! # Cache keys
//!
//! | Lookup | Key | TTL |
//! |---|---|---|
//! | Coupon page | `coupons_<businessId or "all">_<base64 JSON of filters and pagination>` | 5 min |
//! | Customer coupons | `customerCoupons_<customerId>_<options>` | 2 min |
//! | Customer by phone | `customer_phone_<normalized phone>` | 10 min, hits only |

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use couponhub_core::{BusinessId, Coupon, Customer, CustomerCoupon, CustomerCouponStatus, CustomerId};

use crate::cache::CacheManager;
use crate::clock::Clock;
use crate::error::{DataError, Result};
use crate::monitor::PerformanceMonitor;
use crate::query::{
    DEFAULT_MAX_RESULTS, FilterValue, QueryFilters, build_compound_query, normalize_phone_number,
};
use crate::store::{Cursor, Document, DocumentStore, FilterOp, OrderDirection, Query, collections, fields};

/// TTL of a cached coupon page.
pub const COUPON_PAGE_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL of a cached customer-coupon list.
pub const CUSTOMER_COUPONS_TTL: Duration = Duration::from_secs(2 * 60);

/// TTL of a cached phone lookup hit.
pub const CUSTOMER_PHONE_TTL: Duration = Duration::from_secs(10 * 60);

/// Paging and ordering for [`OptimizedCouponService::get_coupons_optimized`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page_size: usize,
    pub order_by: Option<String>,
    pub direction: OrderDirection,
    /// Resume after this position, from a previous page's `last_doc`.
    pub cursor: Option<Cursor>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_MAX_RESULTS,
            order_by: Some(fields::CREATED_AT.to_owned()),
            direction: OrderDirection::Descending,
            cursor: None,
        }
    }
}

impl Pagination {
    /// The same paging, resumed after `cursor`.
    #[must_use]
    pub fn after(&self, cursor: Cursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..self.clone()
        }
    }
}

/// One page of coupons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponPage {
    pub coupons: Vec<Coupon>,
    /// Cursor for the next page; `None` on an empty page.
    pub last_doc: Option<Cursor>,
    /// `true` if at least one more matching coupon exists.
    pub has_more: bool,
}

/// Options for [`OptimizedCouponService::get_customer_coupons_optimized`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCouponOptions {
    /// When `false`, only assignments expiring after now are returned,
    /// soonest first. Assignments without `expiresAt` are then excluded.
    pub include_expired: bool,
    pub status: Option<CustomerCouponStatus>,
    pub limit: usize,
}

impl Default for CustomerCouponOptions {
    fn default() -> Self {
        Self {
            include_expired: false,
            status: None,
            limit: 50,
        }
    }
}

/// Cached, monitored coupon and customer queries.
#[derive(Debug, Clone)]
pub struct OptimizedCouponService {
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheManager>,
    monitor: Arc<PerformanceMonitor>,
    clock: Arc<dyn Clock>,
}

fn decode_all<T: serde::de::DeserializeOwned>(docs: &[Document]) -> Result<Vec<T>> {
    docs.iter()
        .map(|doc| doc.decode().map_err(DataError::from))
        .collect()
}

fn coupon_page_key(filters: &QueryFilters, pagination: &Pagination) -> String {
    let scope = match filters.get(fields::BUSINESS_ID) {
        Some(FilterValue::Equals(Value::String(business_id))) => business_id.as_str(),
        _ => "all",
    };
    let payload = json!({ "filters": filters, "pagination": pagination });
    format!("coupons_{scope}_{}", STANDARD.encode(payload.to_string()))
}

fn customer_coupons_prefix(customer_id: &CustomerId) -> String {
    format!("customerCoupons_{customer_id}_")
}

fn customer_phone_key(normalized: &str) -> String {
    format!("customer_phone_{normalized}")
}

impl OptimizedCouponService {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<CacheManager>,
        monitor: Arc<PerformanceMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            monitor,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_millis()).unwrap_or_default()
    }

    async fn run(&self, query_name: &str, query: &Query) -> Result<Vec<Document>> {
        Ok(self
            .monitor
            .measure(query_name, self.store.run_query(query))
            .await?)
    }

    /// Fetch one page of coupons matching `filters`.
    ///
    /// Requests one row more than the page size to decide `has_more` exactly.
    ///
    /// # Errors
    ///
    /// Returns `DataError::InvalidInput` for a zero page size, or the store
    /// error if the query fails (including a missing composite index).
    #[instrument(skip(self, filters, pagination), fields(page_size = pagination.page_size))]
    pub async fn get_coupons_optimized(
        &self,
        filters: &QueryFilters,
        pagination: &Pagination,
    ) -> Result<CouponPage> {
        if pagination.page_size == 0 {
            return Err(DataError::InvalidInput(
                "page size must be at least 1".to_string(),
            ));
        }

        let key = coupon_page_key(filters, pagination);
        if let Some(page) = self.cache.get::<CouponPage>(&key) {
            self.monitor.track_cache_hit(&key);
            return Ok(page);
        }

        let query = build_compound_query(
            collections::COUPONS,
            filters,
            pagination.order_by.as_deref(),
            pagination.direction,
            pagination.page_size + 1,
            pagination.cursor.as_ref(),
        );
        let mut docs = self.run("getCouponsOptimized", &query).await?;

        let has_more = docs.len() > pagination.page_size;
        docs.truncate(pagination.page_size);

        let order_fields: Vec<&str> = pagination.order_by.as_deref().into_iter().collect();
        let page = CouponPage {
            coupons: decode_all(&docs)?,
            last_doc: docs.last().map(|doc| doc.cursor(&order_fields)),
            has_more,
        };

        debug!(count = page.coupons.len(), has_more, "Fetched coupon page");
        self.cache.set(&key, &page, COUPON_PAGE_TTL);
        Ok(page)
    }

    /// Fetch the coupons assigned to a customer.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    #[instrument(skip(self, customer_id, options), fields(customer_id = %customer_id))]
    pub async fn get_customer_coupons_optimized(
        &self,
        customer_id: &CustomerId,
        options: &CustomerCouponOptions,
    ) -> Result<Vec<CustomerCoupon>> {
        let key = format!(
            "{}{}_{}_{}",
            customer_coupons_prefix(customer_id),
            options.include_expired,
            options.status.map_or("any", CustomerCouponStatus::as_str),
            options.limit
        );
        if let Some(coupons) = self.cache.get::<Vec<CustomerCoupon>>(&key) {
            self.monitor.track_cache_hit(&key);
            return Ok(coupons);
        }

        let mut query =
            Query::new(collections::CUSTOMER_COUPONS).where_eq(fields::CUSTOMER_ID, customer_id.as_str());
        if let Some(status) = options.status {
            query = query.where_eq(fields::STATUS, status.as_str());
        }
        if !options.include_expired {
            let now = self.now().to_rfc3339_opts(SecondsFormat::Millis, true);
            query = query
                .filter(fields::EXPIRES_AT, FilterOp::GreaterThan, now)
                .order_by(fields::EXPIRES_AT, OrderDirection::Ascending);
        }
        let query = query.limit(options.limit);

        let docs = self.run("getCustomerCouponsOptimized", &query).await?;
        let coupons: Vec<CustomerCoupon> = decode_all(&docs)?;

        self.cache.set(&key, &coupons, CUSTOMER_COUPONS_TTL);
        Ok(coupons)
    }

    /// Find a customer by the `phone_normalized` field.
    ///
    /// Only hits are cached; a miss is retried against the store next time.
    /// Customers without `phone_normalized` are not found here until the
    /// phone backfill has run.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    #[instrument(skip(self))]
    pub async fn find_customer_by_phone_optimized(&self, phone: &str) -> Result<Option<Customer>> {
        let normalized = normalize_phone_number(phone);
        if normalized.is_empty() {
            return Ok(None);
        }

        let key = customer_phone_key(&normalized);
        if let Some(customer) = self.cache.get::<Customer>(&key) {
            self.monitor.track_cache_hit(&key);
            return Ok(Some(customer));
        }

        let query = Query::new(collections::CUSTOMERS)
            .where_eq(fields::PHONE_NORMALIZED, normalized.as_str())
            .limit(1);
        let docs = self.run("findCustomerByPhoneOptimized", &query).await?;

        let Some(doc) = docs.first() else {
            debug!("No customer with this phone");
            return Ok(None);
        };
        let customer: Customer = doc.decode()?;
        self.cache.set(&key, &customer, CUSTOMER_PHONE_TTL);
        Ok(Some(customer))
    }

    /// Drop cached coupon pages that may include this business's coupons.
    ///
    /// Returns the number of cache keys removed.
    pub fn invalidate_business(&self, business_id: &BusinessId) -> usize {
        self.cache.invalidate(&format!("coupons_{business_id}_")) + self.cache.invalidate("coupons_all_")
    }

    /// Drop cached coupon lists and phone lookups for a customer.
    ///
    /// Returns the number of cache keys removed.
    pub fn invalidate_customer(&self, customer: &Customer) -> usize {
        let mut removed = self.cache.invalidate(&customer_coupons_prefix(&customer.id));

        let phones = customer.phone.iter().chain(customer.phone_normalized.iter());
        let mut seen = Vec::new();
        for phone in phones {
            let normalized = normalize_phone_number(phone);
            if normalized.is_empty() || seen.contains(&normalized) {
                continue;
            }
            removed += self.cache.invalidate(&customer_phone_key(&normalized));
            seen.push(normalized);
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryStorage;
    use crate::clock::ManualClock;
    use crate::config::{CacheConfig, MonitorConfig};
    use crate::store::InMemoryStore;

    // 2024-06-01T00:00:00Z
    const NOW: i64 = 1_717_200_000_000;

    struct Fixture {
        store: Arc<InMemoryStore>,
        monitor: Arc<PerformanceMonitor>,
        clock: ManualClock,
        service: OptimizedCouponService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(NOW);
        let cache = Arc::new(CacheManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(clock.clone()),
            &CacheConfig::default(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(&MonitorConfig::default()));
        let service = OptimizedCouponService::new(
            store.clone(),
            cache,
            Arc::clone(&monitor),
            Arc::new(clock.clone()),
        );
        Fixture {
            store,
            monitor,
            clock,
            service,
        }
    }

    fn seed_coupons(store: &InMemoryStore, business: &str, count: usize) {
        for i in 0..count {
            store
                .seed(
                    collections::COUPONS,
                    &format!("{business}-k{i:02}"),
                    json!({
                        "businessId": business,
                        "title": format!("Coupon {i}"),
                        "status": "active",
                        "createdAt": format!("2024-05-{:02}T00:00:00Z", i + 1),
                    }),
                )
                .unwrap();
        }
    }

    fn business_filter(business: &str) -> QueryFilters {
        let mut filters = QueryFilters::new();
        filters.insert(fields::BUSINESS_ID.into(), business.into());
        filters
    }

    #[tokio::test]
    async fn test_coupon_pages_walk_with_cursor() {
        let f = fixture();
        seed_coupons(&f.store, "b1", 5);
        seed_coupons(&f.store, "b2", 2);

        let filters = business_filter("b1");
        let pagination = Pagination {
            page_size: 2,
            ..Pagination::default()
        };

        let first = f.service.get_coupons_optimized(&filters, &pagination).await.unwrap();
        assert_eq!(first.coupons.len(), 2);
        assert!(first.has_more);
        // Newest first
        assert_eq!(first.coupons[0].id.as_str(), "b1-k04");

        let second = f
            .service
            .get_coupons_optimized(&filters, &pagination.after(first.last_doc.unwrap()))
            .await
            .unwrap();
        assert_eq!(second.coupons[0].id.as_str(), "b1-k02");
        assert!(second.has_more);

        let third = f
            .service
            .get_coupons_optimized(&filters, &pagination.after(second.last_doc.unwrap()))
            .await
            .unwrap();
        assert_eq!(third.coupons.len(), 1);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_has_more_false_on_exact_boundary() {
        let f = fixture();
        seed_coupons(&f.store, "b1", 3);
        let pagination = Pagination {
            page_size: 3,
            ..Pagination::default()
        };

        let page = f
            .service
            .get_coupons_optimized(&business_filter("b1"), &pagination)
            .await
            .unwrap();
        assert_eq!(page.coupons.len(), 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_coupon_page_served_from_cache_until_ttl() {
        let f = fixture();
        seed_coupons(&f.store, "b1", 2);
        let filters = business_filter("b1");
        let pagination = Pagination::default();

        f.service.get_coupons_optimized(&filters, &pagination).await.unwrap();
        f.service.get_coupons_optimized(&filters, &pagination).await.unwrap();
        assert_eq!(f.store.queries_run(), 1);
        assert_eq!(f.monitor.get_performance_summary().cache_hits, 1);

        f.clock.advance(5 * 60 * 1000);
        f.service.get_coupons_optimized(&filters, &pagination).await.unwrap();
        assert_eq!(f.store.queries_run(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_business_forces_refetch() {
        let f = fixture();
        seed_coupons(&f.store, "b1", 1);
        seed_coupons(&f.store, "b2", 1);
        let pagination = Pagination::default();

        f.service.get_coupons_optimized(&business_filter("b1"), &pagination).await.unwrap();
        f.service.get_coupons_optimized(&business_filter("b2"), &pagination).await.unwrap();
        assert_eq!(f.service.invalidate_business(&BusinessId::new("b1")), 1);

        f.service.get_coupons_optimized(&business_filter("b1"), &pagination).await.unwrap();
        f.service.get_coupons_optimized(&business_filter("b2"), &pagination).await.unwrap();
        assert_eq!(f.store.queries_run(), 3);
    }

    #[tokio::test]
    async fn test_zero_page_size_rejected() {
        let f = fixture();
        let pagination = Pagination {
            page_size: 0,
            ..Pagination::default()
        };
        let err = f
            .service
            .get_coupons_optimized(&QueryFilters::new(), &pagination)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_index_surfaces_and_is_tracked() {
        let f = fixture();
        f.store.require_indexes();
        seed_coupons(&f.store, "b1", 1);

        let err = f
            .service
            .get_coupons_optimized(&business_filter("b1"), &Pagination::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Store(crate::store::StoreError::MissingIndex { .. })));
        assert_eq!(f.monitor.get_performance_summary().errors, 1);

        f.store.add_index(collections::COUPONS, &[fields::BUSINESS_ID, fields::CREATED_AT]);
        assert!(
            f.service
                .get_coupons_optimized(&business_filter("b1"), &Pagination::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_customer_coupons_skip_expired() {
        let f = fixture();
        for (id, expires) in [
            ("cc1", "2024-05-01T00:00:00Z"),
            ("cc2", "2024-07-01T00:00:00Z"),
            ("cc3", "2024-06-15T00:00:00Z"),
        ] {
            f.store
                .seed(
                    collections::CUSTOMER_COUPONS,
                    id,
                    json!({"customerId": "c1", "couponId": "k1", "status": "active", "expiresAt": expires}),
                )
                .unwrap();
        }

        let customer = CustomerId::new("c1");
        let active = f
            .service
            .get_customer_coupons_optimized(&customer, &CustomerCouponOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = active.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cc3", "cc2"]);

        let all = f
            .service
            .get_customer_coupons_optimized(
                &customer,
                &CustomerCouponOptions {
                    include_expired: true,
                    ..CustomerCouponOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_customer_coupons_cached_for_two_minutes() {
        let f = fixture();
        let customer = CustomerId::new("c1");
        let options = CustomerCouponOptions::default();

        f.service.get_customer_coupons_optimized(&customer, &options).await.unwrap();
        f.clock.advance(119_000);
        f.service.get_customer_coupons_optimized(&customer, &options).await.unwrap();
        assert_eq!(f.store.queries_run(), 1);

        f.clock.advance(1_000);
        f.service.get_customer_coupons_optimized(&customer, &options).await.unwrap();
        assert_eq!(f.store.queries_run(), 2);
    }

    #[tokio::test]
    async fn test_find_customer_by_phone_caches_hits_only() {
        let f = fixture();

        let missing = f.service.find_customer_by_phone_optimized("083 209 1122").await.unwrap();
        assert!(missing.is_none());

        f.store
            .seed(
                collections::CUSTOMERS,
                "c1",
                json!({"phone": "083 209 1122", "phone_normalized": "0832091122", "userId": null}),
            )
            .unwrap();

        let found = f
            .service
            .find_customer_by_phone_optimized("083-209-1122")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id.as_str(), "c1");

        f.service.find_customer_by_phone_optimized("(083) 2091122").await.unwrap();
        assert_eq!(f.store.queries_run(), 2);

        assert_eq!(f.service.invalidate_customer(&found), 1);
        f.service.find_customer_by_phone_optimized("0832091122").await.unwrap();
        assert_eq!(f.store.queries_run(), 3);
    }

    #[tokio::test]
    async fn test_empty_phone_short_circuits() {
        let f = fixture();
        assert!(f.service.find_customer_by_phone_optimized(" - ").await.unwrap().is_none());
        assert_eq!(f.store.queries_run(), 0);
    }
}
