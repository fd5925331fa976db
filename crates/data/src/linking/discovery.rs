//! Business discovery for a customer.
//!
//! Works out which businesses a customer has interacted with by unioning
//! business IDs from several independent sources:
//!
//! - the customer's own record (`customers.businessId`)
//! - coupon distributions addressed to the customer
//! - customer-coupon assignments keyed by `customerId`, and separately by
//!   `userId` (the store has no OR across fields)
//! - other customer records sharing the customer's phone number, in any
//!   stored format, and their distributions and assignments
//! - optionally, every active business
//!
//! Records without a denormalized `businessId` are resolved through their
//! coupon's owner, looked up in batches and memoized.
//!
//! Sources run concurrently with a bounded number of queries in flight. A
//! failing source is logged and reported in [`DiscoveryReport::failed_sources`];
//! it does not fail the discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use moka::future::Cache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use couponhub_core::{BusinessId, BusinessStatus, CustomerId, UserId};

use super::lookup::CustomerLookup;
use crate::config::DiscoveryConfig;
use crate::error::{DataError, Result};
use crate::monitor::PerformanceMonitor;
use crate::query::{DEFAULT_ID_BATCH_SIZE, create_batched_id_query};
use crate::store::{Document, DocumentStore, FilterOp, MAX_IN_VALUES, Query, collections, fields};

/// A place business IDs are discovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    ActiveBusinesses,
    CustomerRecord,
    Distributions,
    CustomerCouponsByCustomer,
    CustomerCouponsByUser,
    PhoneMatches,
    CouponOwners,
}

impl DiscoverySource {
    /// Name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ActiveBusinesses => "active_businesses",
            Self::CustomerRecord => "customer_record",
            Self::Distributions => "distributions",
            Self::CustomerCouponsByCustomer => "customer_coupons_by_customer",
            Self::CustomerCouponsByUser => "customer_coupons_by_user",
            Self::PhoneMatches => "phone_matches",
            Self::CouponOwners => "coupon_owners",
        }
    }
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who to discover businesses for. Any combination of identifiers may be
/// known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerContext {
    pub customer_id: Option<CustomerId>,
    pub user_id: Option<UserId>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Also include every active business (capped by the configured limit).
    pub include_active_businesses: bool,
}

/// A source that failed during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: DiscoverySource,
    pub error: String,
}

/// Result of a discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub business_ids: BTreeSet<BusinessId>,
    /// Business IDs contributed per source, before the union.
    pub by_source: BTreeMap<DiscoverySource, usize>,
    pub failed_sources: Vec<SourceFailure>,
}

/// What one source produced.
#[derive(Debug, Default)]
struct SourceHits {
    business_ids: Vec<String>,
    /// Coupons whose owner still has to be looked up.
    coupon_ids: Vec<String>,
    /// Follow-up queries that failed after the source produced some hits.
    partial_failures: Vec<String>,
}

impl SourceHits {
    fn extend_from_docs(&mut self, docs: &[Document]) {
        for doc in docs {
            match doc.str_field(fields::BUSINESS_ID).filter(|id| !id.is_empty()) {
                Some(business_id) => self.business_ids.push(business_id.to_owned()),
                None => {
                    if let Some(coupon_id) = doc.str_field(fields::COUPON_ID) {
                        self.coupon_ids.push(coupon_id.to_owned());
                    }
                }
            }
        }
    }

    fn from_docs(docs: &[Document]) -> Self {
        let mut hits = Self::default();
        hits.extend_from_docs(docs);
        hits
    }
}

type SourceFuture<'a> = BoxFuture<'a, (DiscoverySource, Result<SourceHits>)>;

/// `in` queries on `field`, at most [`MAX_IN_VALUES`] values each.
fn in_queries(collection: &str, field: &str, values: &[String]) -> Vec<Query> {
    values
        .chunks(MAX_IN_VALUES)
        .map(|chunk| {
            let values: Vec<Value> = chunk.iter().map(|v| Value::String(v.clone())).collect();
            Query::new(collection).filter(field, FilterOp::In, values)
        })
        .collect()
}

/// Discovers the businesses a customer is connected to.
#[derive(Clone)]
pub struct BusinessDiscovery {
    inner: Arc<BusinessDiscoveryInner>,
}

struct BusinessDiscoveryInner {
    store: Arc<dyn DocumentStore>,
    lookup: CustomerLookup,
    monitor: Arc<PerformanceMonitor>,
    /// Coupon ID to owning business ID.
    coupon_owners: Cache<String, String>,
    config: DiscoveryConfig,
}

impl BusinessDiscovery {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        monitor: Arc<PerformanceMonitor>,
        config: DiscoveryConfig,
    ) -> Self {
        let coupon_owners = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(600)) // 10 minutes
            .build();

        Self {
            inner: Arc::new(BusinessDiscoveryInner {
                lookup: CustomerLookup::new(Arc::clone(&store)),
                store,
                monitor,
                coupon_owners,
                config,
            }),
        }
    }

    async fn run(&self, source: DiscoverySource, query: &Query) -> Result<Vec<Document>> {
        Ok(self
            .inner
            .monitor
            .measure(source.as_str(), self.inner.store.run_query(query))
            .await?)
    }

    /// IDs of active businesses, up to the configured limit.
    ///
    /// Returns an empty list if the store query fails.
    #[instrument(skip(self))]
    pub async fn get_all_active_business_ids(&self) -> Vec<BusinessId> {
        let query = Query::new(collections::BUSINESSES)
            .where_eq(fields::STATUS, BusinessStatus::Active.as_str())
            .limit(self.inner.config.active_business_limit);

        match self.run(DiscoverySource::ActiveBusinesses, &query).await {
            Ok(docs) => docs.into_iter().map(|doc| BusinessId::new(doc.id)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list active businesses");
                Vec::new()
            }
        }
    }

    fn query_source(&self, source: DiscoverySource, query: Query) -> SourceFuture<'_> {
        async move {
            let result = self.run(source, &query).await.map(|docs| SourceHits::from_docs(&docs));
            (source, result)
        }
        .boxed()
    }

    fn customer_record_source(&self, customer_id: CustomerId) -> SourceFuture<'_> {
        async move {
            let result = self
                .inner
                .store
                .get(collections::CUSTOMERS, customer_id.as_str())
                .await
                .map_err(DataError::from)
                .map(|doc| {
                    let mut hits = SourceHits::default();
                    if let Some(doc) = doc {
                        hits.extend_from_docs(std::slice::from_ref(&doc));
                    }
                    hits
                });
            (DiscoverySource::CustomerRecord, result)
        }
        .boxed()
    }

    fn active_businesses_source(&self) -> SourceFuture<'_> {
        async move {
            let hits = SourceHits {
                business_ids: self
                    .get_all_active_business_ids()
                    .await
                    .into_iter()
                    .map(BusinessId::into_inner)
                    .collect(),
                ..SourceHits::default()
            };
            (DiscoverySource::ActiveBusinesses, Ok(hits))
        }
        .boxed()
    }

    fn phone_source(&self, phone: String, known: Option<CustomerId>) -> SourceFuture<'_> {
        async move {
            let result = self.phone_hits(&phone, known.as_ref()).await;
            (DiscoverySource::PhoneMatches, result)
        }
        .boxed()
    }

    /// Businesses reachable through other customer records with the same
    /// phone number.
    async fn phone_hits(&self, phone: &str, known: Option<&CustomerId>) -> Result<SourceHits> {
        let customers = self.inner.lookup.find_customers_by_phone(phone).await?;

        let mut hits = SourceHits::default();
        let mut other_ids = Vec::new();
        for customer in &customers {
            if let Some(business_id) = &customer.business_id {
                hits.business_ids.push(business_id.as_str().to_owned());
            }
            if known != Some(&customer.id) {
                other_ids.push(customer.id.as_str().to_owned());
            }
        }
        debug!(matches = customers.len(), "Phone join matched customers");

        let queries = in_queries(collections::COUPON_DISTRIBUTIONS, fields::CUSTOMER_ID, &other_ids)
            .into_iter()
            .chain(in_queries(collections::CUSTOMER_COUPONS, fields::CUSTOMER_ID, &other_ids));
        for query in queries {
            match self.run(DiscoverySource::PhoneMatches, &query).await {
                Ok(docs) => hits.extend_from_docs(&docs),
                Err(e) => {
                    warn!(collection = %query.collection, error = %e, "Phone follow-up query failed");
                    hits.partial_failures.push(e.to_string());
                }
            }
        }

        Ok(hits)
    }

    /// Union business IDs from every source that applies to `context`.
    #[instrument(skip(self, context), fields(customer_id = ?context.customer_id, user_id = ?context.user_id))]
    pub async fn discover_business_ids(
        &self,
        context: &CustomerContext,
        options: DiscoveryOptions,
    ) -> DiscoveryReport {
        let mut sources: Vec<SourceFuture<'_>> = Vec::new();

        if options.include_active_businesses {
            sources.push(self.active_businesses_source());
        }
        if let Some(customer_id) = &context.customer_id {
            sources.push(self.customer_record_source(customer_id.clone()));
            sources.push(self.query_source(
                DiscoverySource::Distributions,
                Query::new(collections::COUPON_DISTRIBUTIONS)
                    .where_eq(fields::CUSTOMER_ID, customer_id.as_str()),
            ));
            sources.push(self.query_source(
                DiscoverySource::CustomerCouponsByCustomer,
                Query::new(collections::CUSTOMER_COUPONS)
                    .where_eq(fields::CUSTOMER_ID, customer_id.as_str()),
            ));
        }
        if let Some(user_id) = &context.user_id {
            sources.push(self.query_source(
                DiscoverySource::CustomerCouponsByUser,
                Query::new(collections::CUSTOMER_COUPONS).where_eq(fields::USER_ID, user_id.as_str()),
            ));
        }
        if let Some(phone) = context.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            sources.push(self.phone_source(phone.to_owned(), context.customer_id.clone()));
        }

        let concurrency = self.inner.config.max_concurrent_queries.max(1);
        let outcomes: Vec<(DiscoverySource, Result<SourceHits>)> = stream::iter(sources)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = DiscoveryReport::default();
        let mut pending_coupons = BTreeSet::new();

        for (source, outcome) in outcomes {
            match outcome {
                Ok(hits) => {
                    report.add(source, hits.business_ids);
                    pending_coupons.extend(hits.coupon_ids);
                    report.failed_sources.extend(
                        hits.partial_failures
                            .into_iter()
                            .map(|error| SourceFailure { source, error }),
                    );
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Discovery source failed");
                    report.failed_sources.push(SourceFailure {
                        source,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !pending_coupons.is_empty() {
            let pending: Vec<String> = pending_coupons.into_iter().collect();
            self.resolve_coupon_owners(&pending, &mut report).await;
        }

        report.failed_sources.sort_by_key(|failure| failure.source);
        info!(
            businesses = report.business_ids.len(),
            failed = report.failed_sources.len(),
            "Business discovery finished"
        );
        report
    }

    /// Map coupon IDs to their owners, from cache or by batched lookup.
    async fn resolve_coupon_owners(&self, coupon_ids: &[String], report: &mut DiscoveryReport) {
        let mut owners = Vec::new();
        let mut unknown = Vec::new();
        for coupon_id in coupon_ids {
            match self.inner.coupon_owners.get(coupon_id).await {
                Some(owner) => owners.push(owner),
                None => unknown.push(coupon_id.clone()),
            }
        }
        debug!(cached = owners.len(), lookups = unknown.len(), "Resolving coupon owners");

        let batches = create_batched_id_query(collections::COUPONS, &unknown, DEFAULT_ID_BATCH_SIZE);
        let results: Vec<Result<Vec<Document>>> = stream::iter(batches)
            .map(|query| async move { self.run(DiscoverySource::CouponOwners, &query).await })
            .buffer_unordered(self.inner.config.max_concurrent_queries.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(docs) => {
                    for doc in docs {
                        if let Some(owner) = doc.str_field(fields::BUSINESS_ID) {
                            self.inner
                                .coupon_owners
                                .insert(doc.id.clone(), owner.to_owned())
                                .await;
                            owners.push(owner.to_owned());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Coupon owner lookup failed");
                    report.failed_sources.push(SourceFailure {
                        source: DiscoverySource::CouponOwners,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.add(DiscoverySource::CouponOwners, owners);
    }
}

impl DiscoveryReport {
    fn add(&mut self, source: DiscoverySource, business_ids: Vec<String>) {
        if business_ids.is_empty() {
            return;
        }
        *self.by_source.entry(source).or_default() += business_ids.len();
        self.business_ids
            .extend(business_ids.into_iter().map(BusinessId::new));
    }
}
