//! Customer/user link verification and repair.
//!
//! A link is two pointers that should agree: `customers.userId` and
//! `users.linkedCustomerId`. Data written by older clients breaks this in
//! three ways, all fixed by [`LinkVerifier::repair_all_broken_links`]:
//!
//! - a customer points at a user that no longer exists: the customer is
//!   unlinked
//! - several customers point at one user: the most recently updated keeps the
//!   link, the others are unlinked
//! - the user's `linkedCustomerId` disagrees with the customer that keeps the
//!   link: the user is updated
//!
//! Each user's fixes are committed as one write batch, split into consecutive
//! batches of at most [`MAX_BATCH_WRITES`] writes for very large groups.
//! Groups are independent, so a failure part-way through leaves earlier groups
//! repaired and is recorded in the report.
//!
//! Grouping reads `userId` and `updatedAt` straight from the stored fields.
//! A customer whose document does not decode as a [`Customer`] is still
//! repaired and is listed in [`RepairReport::malformed_customers`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use couponhub_core::{Customer, CustomerId, User, UserId};

use crate::clock::Clock;
use crate::error::{DataError, Result};
use crate::store::{
    Document, DocumentStore, FilterOp, MAX_BATCH_WRITES, Query, WriteBatch, collections, encode_fields, fields,
};

/// State of the link between one customer and one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub customer_exists: bool,
    pub user_exists: bool,
    /// `customers.userId` is the user.
    pub customer_points_to_user: bool,
    /// `users.linkedCustomerId` is the customer.
    pub user_points_to_customer: bool,
}

impl LinkStatus {
    /// Both documents exist and point at each other.
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.customer_exists
            && self.user_exists
            && self.customer_points_to_user
            && self.user_points_to_customer
    }

    /// Exactly one side points at the other.
    #[must_use]
    pub const fn is_half_linked(&self) -> bool {
        self.customer_points_to_user != self.user_points_to_customer
    }
}

/// A user claimed by more than one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateLink {
    pub user_id: UserId,
    /// Most recently updated first.
    pub customer_ids: Vec<CustomerId>,
}

/// A user group whose repair could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupFailure {
    pub user_id: UserId,
    pub error: String,
}

/// What a repair sweep did, or would do in a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub dry_run: bool,
    pub users_checked: usize,
    /// Customers unlinked because their user does not exist.
    pub orphaned_customers: Vec<CustomerId>,
    /// Customers unlinked because a more recently updated customer holds the
    /// same user.
    pub duplicate_customers: Vec<CustomerId>,
    /// Users whose `linkedCustomerId` was corrected.
    pub users_relinked: Vec<UserId>,
    /// Linked customers whose documents do not decode cleanly. Those with a
    /// string `userId` are repaired like any other.
    pub malformed_customers: Vec<CustomerId>,
    pub failed_groups: Vec<GroupFailure>,
}

impl RepairReport {
    /// Total number of documents changed (or to be changed).
    #[must_use]
    pub fn changes(&self) -> usize {
        self.orphaned_customers.len() + self.duplicate_customers.len() + self.users_relinked.len()
    }
}

/// The fields of a linked customer that repair needs.
#[derive(Debug, Clone)]
struct LinkedCustomer {
    id: CustomerId,
    updated_at: Option<DateTime<Utc>>,
}

/// Linked customers grouped by `userId`.
#[derive(Debug, Default)]
struct CustomerGroups {
    by_user: BTreeMap<UserId, Vec<LinkedCustomer>>,
    malformed: Vec<CustomerId>,
}

/// Read a stored timestamp: an RFC 3339 string, or a `{seconds, nanoseconds}`
/// object as written by the document store's own timestamp type.
fn stored_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Object(map) => {
            let seconds = map.get("seconds").or_else(|| map.get("_seconds"))?.as_i64()?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

fn group_customers(docs: &[Document]) -> CustomerGroups {
    let mut groups = CustomerGroups::default();
    for doc in docs {
        let id = CustomerId::new(doc.id.clone());
        if let Err(e) = doc.decode::<Customer>() {
            warn!(customer_id = %id, error = %e, "Malformed customer document");
            groups.malformed.push(id.clone());
        }
        let Some(user_id) = doc.str_field(fields::USER_ID) else {
            warn!(customer_id = %id, "Customer userId is not a string, skipping");
            continue;
        };
        let updated_at = doc.fields.get(fields::UPDATED_AT).and_then(stored_timestamp);
        groups
            .by_user
            .entry(UserId::new(user_id))
            .or_default()
            .push(LinkedCustomer { id, updated_at });
    }
    groups
}

/// Most recently updated first; missing timestamps last, ties by lowest ID.
fn newest_first(a: &LinkedCustomer, b: &LinkedCustomer) -> std::cmp::Ordering {
    b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
}

/// Planned writes for one user group.
#[derive(Debug, Default)]
struct GroupPlan {
    orphaned: Vec<CustomerId>,
    duplicates: Vec<CustomerId>,
    relink_to: Option<CustomerId>,
}

/// Verifies and repairs customer/user links.
#[derive(Debug, Clone)]
pub struct LinkVerifier {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl LinkVerifier {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> String {
        DateTime::from_timestamp_millis(self.clock.now_millis())
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    async fn load_customer(&self, customer_id: &CustomerId) -> Result<Option<Customer>> {
        match self.store.get(collections::CUSTOMERS, customer_id.as_str()).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    async fn load_user(&self, user_id: &UserId) -> Result<Option<User>> {
        match self.store.get(collections::USERS, user_id.as_str()).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Check both sides of a customer/user link.
    ///
    /// # Errors
    ///
    /// Returns the store error if either read fails, or a serialization error
    /// if a document is malformed.
    #[instrument(skip(self))]
    pub async fn verify_customer_user_link(
        &self,
        customer_id: &CustomerId,
        user_id: &UserId,
    ) -> Result<LinkStatus> {
        let (customer, user) =
            futures::try_join!(self.load_customer(customer_id), self.load_user(user_id))?;

        let status = LinkStatus {
            customer_exists: customer.is_some(),
            user_exists: user.is_some(),
            customer_points_to_user: customer
                .as_ref()
                .is_some_and(|c| c.user_id.as_ref() == Some(user_id)),
            user_points_to_customer: user
                .as_ref()
                .is_some_and(|u| u.linked_customer_id.as_ref() == Some(customer_id)),
        };
        debug!(?status, "Verified link");
        Ok(status)
    }

    /// Link a customer and a user, writing both sides in one batch.
    ///
    /// # Errors
    ///
    /// Returns `DataError::NotFound` if either document is missing, or the
    /// store error if the write fails.
    #[instrument(skip(self))]
    pub async fn link_customer_to_user(&self, customer_id: &CustomerId, user_id: &UserId) -> Result<()> {
        let status = self.verify_customer_user_link(customer_id, user_id).await?;
        if !status.customer_exists {
            return Err(DataError::NotFound(format!("customer {customer_id}")));
        }
        if !status.user_exists {
            return Err(DataError::NotFound(format!("user {user_id}")));
        }
        if status.is_linked() {
            debug!("Already linked");
            return Ok(());
        }

        let now = self.now();
        let mut batch = WriteBatch::new();
        batch.update(
            collections::CUSTOMERS,
            customer_id.as_str(),
            encode_fields(&json!({ fields::USER_ID: user_id, fields::UPDATED_AT: now }))?,
        );
        batch.update(
            collections::USERS,
            user_id.as_str(),
            encode_fields(&json!({ fields::LINKED_CUSTOMER_ID: customer_id, fields::UPDATED_AT: now }))?,
        );
        self.store.commit(batch).await?;

        info!("Linked customer to user");
        Ok(())
    }

    /// Every customer with a `userId`, grouped by that user.
    async fn linked_customers_by_user(&self) -> Result<CustomerGroups> {
        let query = Query::new(collections::CUSTOMERS).filter(fields::USER_ID, FilterOp::NotEqual, Value::Null);
        let docs = self.store.run_query(&query).await?;
        Ok(group_customers(&docs))
    }

    /// Users linked from more than one customer.
    ///
    /// # Errors
    ///
    /// Returns the store error if the customer query fails.
    #[instrument(skip(self))]
    pub async fn find_duplicate_links(&self) -> Result<Vec<DuplicateLink>> {
        let duplicates: Vec<DuplicateLink> = self
            .linked_customers_by_user()
            .await?
            .by_user
            .into_iter()
            .filter(|(_, customers)| customers.len() > 1)
            .map(|(user_id, mut customers)| {
                customers.sort_by(newest_first);
                DuplicateLink {
                    user_id,
                    customer_ids: customers.into_iter().map(|c| c.id).collect(),
                }
            })
            .collect();

        debug!(count = duplicates.len(), "Found duplicate links");
        Ok(duplicates)
    }

    /// Work out the fixes for one user and their linked customers.
    fn plan_group(user: Option<&User>, customers: &[LinkedCustomer]) -> GroupPlan {
        let Some(user) = user else {
            return GroupPlan {
                orphaned: customers.iter().map(|c| c.id.clone()).collect(),
                ..GroupPlan::default()
            };
        };

        let Some(keep) = customers.iter().min_by(|a, b| newest_first(a, b)) else {
            return GroupPlan::default();
        };

        GroupPlan {
            orphaned: Vec::new(),
            duplicates: customers
                .iter()
                .filter(|c| c.id != keep.id)
                .map(|c| c.id.clone())
                .collect(),
            relink_to: (user.linked_customer_id.as_ref() != Some(&keep.id)).then(|| keep.id.clone()),
        }
    }

    /// The writes for a plan, in batches of at most [`MAX_BATCH_WRITES`].
    fn plan_batches(&self, user_id: &UserId, plan: &GroupPlan) -> Result<Vec<WriteBatch>> {
        let now = self.now();
        let unlink = encode_fields(&json!({ fields::USER_ID: Value::Null, fields::UPDATED_AT: now }))?;

        let mut batches: Vec<WriteBatch> = Vec::new();
        let mut push = |collection: &str, id: &str, update| {
            if batches.last().is_none_or(|b| b.len() >= MAX_BATCH_WRITES) {
                batches.push(WriteBatch::new());
            }
            if let Some(batch) = batches.last_mut() {
                batch.update(collection, id, update);
            }
        };

        for customer_id in plan.orphaned.iter().chain(&plan.duplicates) {
            push(collections::CUSTOMERS, customer_id.as_str(), unlink.clone());
        }
        if let Some(customer_id) = &plan.relink_to {
            push(
                collections::USERS,
                user_id.as_str(),
                encode_fields(&json!({ fields::LINKED_CUSTOMER_ID: customer_id, fields::UPDATED_AT: now }))?,
            );
        }
        Ok(batches)
    }

    async fn repair_group(
        &self,
        user_id: &UserId,
        customers: &[LinkedCustomer],
        dry_run: bool,
    ) -> Result<GroupPlan> {
        let user = self.load_user(user_id).await?;
        let plan = Self::plan_group(user.as_ref(), customers);

        let batches = self.plan_batches(user_id, &plan)?;
        if batches.is_empty() {
            return Ok(plan);
        }

        if user.is_none() {
            warn!(user_id = %user_id, customers = plan.orphaned.len(), "Customers linked to missing user");
        } else if !plan.duplicates.is_empty() {
            warn!(user_id = %user_id, duplicates = plan.duplicates.len(), "User linked from several customers");
        }

        if !dry_run {
            let count = batches.len();
            for (n, batch) in batches.into_iter().enumerate() {
                self.store.commit(batch).await?;
                debug!(user_id = %user_id, batch = n + 1, of = count, "Committed repair batch");
            }
        }
        Ok(plan)
    }

    /// Sweep every linked customer and repair broken links.
    ///
    /// With `dry_run`, nothing is written and the report lists what would
    /// change.
    ///
    /// # Errors
    ///
    /// Returns the store error only if the initial customer query fails.
    /// Failures within a user group are recorded in the report and the sweep
    /// continues.
    #[instrument(skip(self))]
    pub async fn repair_all_broken_links(&self, dry_run: bool) -> Result<RepairReport> {
        let groups = self.linked_customers_by_user().await?;

        let mut report = RepairReport {
            dry_run,
            users_checked: groups.by_user.len(),
            malformed_customers: groups.malformed,
            ..RepairReport::default()
        };

        for (user_id, customers) in &groups.by_user {
            match self.repair_group(user_id, customers, dry_run).await {
                Ok(plan) => {
                    report.orphaned_customers.extend(plan.orphaned);
                    report.duplicate_customers.extend(plan.duplicates);
                    if plan.relink_to.is_some() {
                        report.users_relinked.push(user_id.clone());
                    }
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Link repair failed for user");
                    report.failed_groups.push(GroupFailure {
                        user_id: user_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            dry_run,
            users = report.users_checked,
            changes = report.changes(),
            malformed = report.malformed_customers.len(),
            failed = report.failed_groups.len(),
            "Link repair finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    fn verifier(store: &Arc<InMemoryStore>) -> LinkVerifier {
        LinkVerifier::new(store.clone(), Arc::new(ManualClock::new(1_717_200_000_000)))
    }

    fn user_id_of(store: &InMemoryStore, customer: &str) -> Value {
        store
            .document(collections::CUSTOMERS, customer)
            .unwrap()
            .field(fields::USER_ID)
            .unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn test_keeps_most_recently_updated_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(collections::CUSTOMERS, "c1", json!({"userId": "u1", "updatedAt": "2024-01-01T00:00:00Z"}))
            .unwrap();
        store
            .seed(collections::CUSTOMERS, "c2", json!({"userId": "u1", "updatedAt": "2024-02-01T00:00:00Z"}))
            .unwrap();
        store
            .seed(collections::USERS, "u1", json!({"linkedCustomerId": "c1"}))
            .unwrap();

        let report = verifier(&store).repair_all_broken_links(false).await.unwrap();

        assert_eq!(user_id_of(&store, "c1"), Value::Null);
        assert_eq!(user_id_of(&store, "c2"), json!("u1"));
        assert_eq!(
            store.document(collections::USERS, "u1").unwrap().field(fields::LINKED_CUSTOMER_ID),
            Some(json!("c2"))
        );
        assert_eq!(report.duplicate_customers, vec![CustomerId::new("c1")]);
        assert_eq!(report.users_relinked, vec![UserId::new("u1")]);
    }

    #[tokio::test]
    async fn test_unlinks_customers_of_missing_user() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(collections::CUSTOMERS, "c1", json!({"userId": "gone"})).unwrap();
        store.seed(collections::CUSTOMERS, "c2", json!({"userId": "gone"})).unwrap();
        store.seed(collections::CUSTOMERS, "c3", json!({"userId": null})).unwrap();

        let report = verifier(&store).repair_all_broken_links(false).await.unwrap();

        assert_eq!(report.users_checked, 1);
        assert_eq!(report.orphaned_customers.len(), 2);
        assert_eq!(user_id_of(&store, "c1"), Value::Null);
        assert_eq!(user_id_of(&store, "c2"), Value::Null);
    }

    #[tokio::test]
    async fn test_single_customer_fixes_user_pointer() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(collections::CUSTOMERS, "c1", json!({"userId": "u1"})).unwrap();
        store.seed(collections::USERS, "u1", json!({"linkedCustomerId": null})).unwrap();
        store.seed(collections::CUSTOMERS, "c2", json!({"userId": "u2"})).unwrap();
        store.seed(collections::USERS, "u2", json!({"linkedCustomerId": "c2"})).unwrap();

        let report = verifier(&store).repair_all_broken_links(false).await.unwrap();

        assert_eq!(report.users_relinked, vec![UserId::new("u1")]);
        assert_eq!(report.changes(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(collections::CUSTOMERS, "c1", json!({"userId": "gone"})).unwrap();

        let report = verifier(&store).repair_all_broken_links(true).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.orphaned_customers, vec![CustomerId::new("c1")]);
        assert_eq!(user_id_of(&store, "c1"), json!("gone"));
    }

    #[tokio::test]
    async fn test_group_failure_recorded_and_sweep_continues() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(collections::CUSTOMERS, "c1", json!({"userId": "u1"})).unwrap();
        store.seed(collections::USERS, "u1", json!({"linkedCustomerId": "c1"})).unwrap();
        store.fail_collection(collections::USERS, "unavailable");

        let report = verifier(&store).repair_all_broken_links(false).await.unwrap();
        assert_eq!(report.failed_groups.len(), 1);
        assert_eq!(report.failed_groups[0].user_id, UserId::new("u1"));
    }

    #[tokio::test]
    async fn test_verify_and_link() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(collections::CUSTOMERS, "c1", json!({"userId": null})).unwrap();
        store.seed(collections::USERS, "u1", json!({"linkedCustomerId": null})).unwrap();
        let verifier = verifier(&store);
        let (customer, user) = (CustomerId::new("c1"), UserId::new("u1"));

        let before = verifier.verify_customer_user_link(&customer, &user).await.unwrap();
        assert!(!before.is_linked());
        assert!(!before.is_half_linked());

        verifier.link_customer_to_user(&customer, &user).await.unwrap();
        let after = verifier.verify_customer_user_link(&customer, &user).await.unwrap();
        assert!(after.is_linked());

        let missing = verifier
            .link_customer_to_user(&CustomerId::new("nope"), &user)
            .await
            .unwrap_err();
        assert!(matches!(missing, DataError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_verify_propagates_store_errors() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_collection(collections::CUSTOMERS, "offline");
        let err = verifier(&store)
            .verify_customer_user_link(&CustomerId::new("c1"), &UserId::new("u1"))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_find_duplicate_links() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(collections::CUSTOMERS, "c1", json!({"userId": "u1", "updatedAt": "2024-01-01T00:00:00Z"}))
            .unwrap();
        store
            .seed(collections::CUSTOMERS, "c2", json!({"userId": "u1", "updatedAt": "2024-05-01T00:00:00Z"}))
            .unwrap();
        store.seed(collections::CUSTOMERS, "c3", json!({"userId": "u2"})).unwrap();

        let duplicates = verifier(&store).find_duplicate_links().await.unwrap();
        assert_eq!(
            duplicates,
            vec![DuplicateLink {
                user_id: UserId::new("u1"),
                customer_ids: vec![CustomerId::new("c2"), CustomerId::new("c1")],
            }]
        );
    }

    #[test]
    fn test_stored_timestamp_shapes() {
        let expected = DateTime::from_timestamp(1_714_521_600, 0);
        assert_eq!(stored_timestamp(&json!("2024-05-01T00:00:00Z")), expected);
        assert_eq!(stored_timestamp(&json!({"seconds": 1_714_521_600})), expected);
        assert_eq!(
            stored_timestamp(&json!({"_seconds": 1_714_521_600, "_nanoseconds": 0})),
            expected
        );
        assert_eq!(stored_timestamp(&json!(1_714_521_600)), None);
        assert_eq!(stored_timestamp(&json!("yesterday")), None);
    }

    #[tokio::test]
    async fn test_native_timestamp_can_win_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(collections::CUSTOMERS, "c1", json!({"userId": "u1", "updatedAt": "2024-01-01T00:00:00Z"}))
            .unwrap();
        store
            .seed(collections::CUSTOMERS, "c2", json!({"userId": "u1", "updatedAt": {"seconds": 1_714_521_600}}))
            .unwrap();
        store.seed(collections::USERS, "u1", json!({"linkedCustomerId": "c2"})).unwrap();

        let report = verifier(&store).repair_all_broken_links(false).await.unwrap();

        assert_eq!(report.duplicate_customers, vec![CustomerId::new("c1")]);
        assert_eq!(report.malformed_customers, vec![CustomerId::new("c2")]);
        assert!(report.users_relinked.is_empty());
        assert_eq!(user_id_of(&store, "c2"), json!("u1"));
    }
}
