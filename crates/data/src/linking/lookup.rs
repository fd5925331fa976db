//! Customer resolution by phone, email, and user account.
//!
//! Phone numbers were stored in whatever shape the business typed them, so a
//! single number may live as `083 209 1122`, `0832091122`, `27832091122` or
//! `+27832091122`. Lookups query every variant against both the raw `phone`
//! field and the digits-only `phone_normalized` field, then confirm each
//! candidate with [`phone_numbers_match`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use couponhub_core::{Customer, Email, User, UserId, phone_numbers_match, phone_variants};

use crate::error::{DataError, Result};
use crate::store::{Document, DocumentStore, FilterOp, MAX_IN_VALUES, Query, collections, fields};

/// How [`CustomerLookup::find_customer_for_user`] found the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// `customers.userId` points at the user.
    UserId,
    /// `users.linkedCustomerId` points at the customer.
    LinkedCustomerId,
    Email,
    Phone,
}

/// A customer resolved for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCustomer {
    pub customer: Customer,
    pub matched_by: MatchedBy,
}

/// Read-only customer lookups.
#[derive(Debug, Clone)]
pub struct CustomerLookup {
    store: Arc<dyn DocumentStore>,
}

fn string_values(values: &[String]) -> Vec<Value> {
    values.iter().map(|v| Value::String(v.clone())).collect()
}

/// Decode documents into customers, skipping ones that do not fit.
pub(crate) fn decode_customers(docs: &[Document]) -> Vec<Customer> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<Customer>() {
            Ok(customer) => Some(customer),
            Err(e) => {
                warn!(customer_id = %doc.id, error = %e, "Skipping malformed customer document");
                None
            }
        })
        .collect()
}

/// The most recently updated customer. Missing `updatedAt` counts as oldest;
/// ties go to the lowest ID.
pub(crate) fn most_recently_updated(customers: &[Customer]) -> Option<&Customer> {
    customers.iter().max_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| b.id.cmp(&a.id))
    })
}

impl CustomerLookup {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Find every customer whose phone matches `phone` in any stored format.
    ///
    /// Results are unique by ID and sorted by ID.
    ///
    /// # Errors
    ///
    /// Returns the store error if either query fails.
    #[instrument(skip(self))]
    pub async fn find_customers_by_phone(&self, phone: &str) -> Result<Vec<Customer>> {
        let mut variants = phone_variants(phone);
        if variants.is_empty() {
            return Ok(Vec::new());
        }
        variants.truncate(MAX_IN_VALUES);

        let digit_variants: Vec<String> = variants
            .iter()
            .filter(|v| v.chars().all(|c| c.is_ascii_digit()))
            .cloned()
            .collect();

        let by_raw = Query::new(collections::CUSTOMERS).filter(
            fields::PHONE,
            FilterOp::In,
            string_values(&variants),
        );
        let by_normalized = Query::new(collections::CUSTOMERS).filter(
            fields::PHONE_NORMALIZED,
            FilterOp::In,
            string_values(&digit_variants),
        );

        let (raw_docs, normalized_docs) = if digit_variants.is_empty() {
            (self.store.run_query(&by_raw).await?, Vec::new())
        } else {
            futures::try_join!(
                self.store.run_query(&by_raw),
                self.store.run_query(&by_normalized)
            )?
        };

        let mut unique: BTreeMap<String, Document> = BTreeMap::new();
        for doc in raw_docs.into_iter().chain(normalized_docs) {
            unique.entry(doc.id.clone()).or_insert(doc);
        }
        let docs: Vec<Document> = unique.into_values().collect();

        let matches: Vec<Customer> = decode_customers(&docs)
            .into_iter()
            .filter(|customer| {
                customer
                    .phone
                    .iter()
                    .chain(customer.phone_normalized.iter())
                    .any(|stored| phone_numbers_match(phone, stored))
            })
            .collect();

        debug!(variants = variants.len(), found = matches.len(), "Phone lookup finished");
        Ok(matches)
    }

    /// Find a customer by email address.
    ///
    /// Matches the lower-cased address and the address as given.
    ///
    /// # Errors
    ///
    /// Returns `DataError::InvalidInput` for a malformed address, or the
    /// store error if the query fails.
    #[instrument(skip(self))]
    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        let parsed = Email::parse(email).map_err(|e| DataError::InvalidInput(e.to_string()))?;

        let mut candidates = vec![parsed.as_str().to_owned()];
        let trimmed = email.trim();
        if trimmed != parsed.as_str() {
            candidates.push(trimmed.to_owned());
        }

        let query = Query::new(collections::CUSTOMERS)
            .filter(fields::EMAIL, FilterOp::In, string_values(&candidates))
            .limit(1);
        let docs = self.store.run_query(&query).await?;
        Ok(decode_customers(&docs).into_iter().next())
    }

    /// Resolve the customer record for a user account.
    ///
    /// Tries, in order: customers whose `userId` is the user (most recently
    /// updated wins), the user's `linkedCustomerId`, the user's email, then
    /// the user's phone.
    ///
    /// # Errors
    ///
    /// Returns the store error if a lookup fails. A malformed email on the
    /// user document is skipped rather than reported.
    #[instrument(skip(self, user_id), fields(user_id = %user_id))]
    pub async fn find_customer_for_user(&self, user_id: &UserId) -> Result<Option<ResolvedCustomer>> {
        let query = Query::new(collections::CUSTOMERS).where_eq(fields::USER_ID, user_id.as_str());
        let linked = decode_customers(&self.store.run_query(&query).await?);
        if let Some(customer) = most_recently_updated(&linked) {
            if linked.len() > 1 {
                warn!(count = linked.len(), "User has several linked customers");
            }
            return Ok(Some(ResolvedCustomer {
                customer: customer.clone(),
                matched_by: MatchedBy::UserId,
            }));
        }

        let Some(user_doc) = self.store.get(collections::USERS, user_id.as_str()).await? else {
            debug!("User document not found");
            return Ok(None);
        };
        let user: User = user_doc.decode()?;

        if let Some(customer_id) = &user.linked_customer_id {
            if let Some(doc) = self.store.get(collections::CUSTOMERS, customer_id.as_str()).await? {
                return Ok(Some(ResolvedCustomer {
                    customer: doc.decode()?,
                    matched_by: MatchedBy::LinkedCustomerId,
                }));
            }
            warn!(customer_id = %customer_id, "linkedCustomerId points at a missing customer");
        }

        if let Some(email) = &user.email {
            match self.find_customer_by_email(email).await {
                Ok(Some(customer)) => {
                    return Ok(Some(ResolvedCustomer {
                        customer,
                        matched_by: MatchedBy::Email,
                    }));
                }
                Ok(None) | Err(DataError::InvalidInput(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(phone) = &user.phone {
            let mut customers = self.find_customers_by_phone(phone).await?;
            // Prefer a customer not already claimed by another account
            customers.sort_by_key(|c| c.user_id.is_some());
            if let Some(customer) = customers.into_iter().next() {
                return Ok(Some(ResolvedCustomer {
                    customer,
                    matched_by: MatchedBy::Phone,
                }));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryStore;

    fn store() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store
            .seed(
                collections::CUSTOMERS,
                "c1",
                json!({"phone": "083 209 1122", "userId": null, "businessId": "b1"}),
            )
            .unwrap();
        store
            .seed(
                collections::CUSTOMERS,
                "c2",
                json!({"phone": "+27832091122", "phone_normalized": "27832091122", "userId": null}),
            )
            .unwrap();
        store
            .seed(
                collections::CUSTOMERS,
                "c3",
                json!({"phone": "0839999999", "email": "thandi@example.com", "userId": null}),
            )
            .unwrap();
        Arc::new(store)
    }

    async fn phone_ids(lookup: &CustomerLookup, phone: &str) -> Vec<String> {
        lookup
            .find_customers_by_phone(phone)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id.into_inner())
            .collect()
    }

    #[tokio::test]
    async fn test_phone_lookup_across_formats() {
        let lookup = CustomerLookup::new(store());
        assert_eq!(phone_ids(&lookup, "083 209 1122").await, vec!["c1", "c2"]);
        // c1 is stored only in its spaced form and has no phone_normalized yet
        assert_eq!(phone_ids(&lookup, "0832091122").await, vec!["c2"]);
    }

    #[tokio::test]
    async fn test_phone_lookup_no_match() {
        let lookup = CustomerLookup::new(store());
        assert!(lookup.find_customers_by_phone("0721234567").await.unwrap().is_empty());
        assert!(lookup.find_customers_by_phone("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_email_lookup_is_case_insensitive() {
        let lookup = CustomerLookup::new(store());
        let found = lookup
            .find_customer_by_email(" Thandi@Example.com ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id.as_str(), "c3");

        let err = lookup.find_customer_by_email("nope").await.unwrap_err();
        assert!(matches!(err, DataError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_customer_for_user_fallback_order() {
        let store = store();
        store
            .seed(collections::USERS, "u1", json!({"email": "thandi@example.com", "linkedCustomerId": null}))
            .unwrap();
        store
            .seed(collections::USERS, "u2", json!({"phone": "083 209 1122", "linkedCustomerId": null}))
            .unwrap();
        store
            .seed(collections::USERS, "u3", json!({"linkedCustomerId": "c2"}))
            .unwrap();
        let lookup = CustomerLookup::new(store.clone());

        let by_email = lookup.find_customer_for_user(&UserId::new("u1")).await.unwrap().unwrap();
        assert_eq!(by_email.matched_by, MatchedBy::Email);
        assert_eq!(by_email.customer.id.as_str(), "c3");

        let by_phone = lookup.find_customer_for_user(&UserId::new("u2")).await.unwrap().unwrap();
        assert_eq!(by_phone.matched_by, MatchedBy::Phone);
        assert_eq!(by_phone.customer.id.as_str(), "c1");

        let by_link = lookup.find_customer_for_user(&UserId::new("u3")).await.unwrap().unwrap();
        assert_eq!(by_link.matched_by, MatchedBy::LinkedCustomerId);
        assert_eq!(by_link.customer.id.as_str(), "c2");

        assert!(lookup.find_customer_for_user(&UserId::new("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_customer_for_user_prefers_user_id_field() {
        let store = store();
        store
            .seed(
                collections::CUSTOMERS,
                "c4",
                json!({"userId": "u9", "updatedAt": "2024-01-01T00:00:00Z"}),
            )
            .unwrap();
        store
            .seed(
                collections::CUSTOMERS,
                "c5",
                json!({"userId": "u9", "updatedAt": "2024-03-01T00:00:00Z"}),
            )
            .unwrap();

        let lookup = CustomerLookup::new(store);
        let resolved = lookup.find_customer_for_user(&UserId::new("u9")).await.unwrap().unwrap();
        assert_eq!(resolved.matched_by, MatchedBy::UserId);
        assert_eq!(resolved.customer.id.as_str(), "c5");
    }

    #[test]
    fn test_most_recently_updated_treats_missing_as_oldest() {
        let customers: Vec<Customer> = vec![
            serde_json::from_value(json!({"id": "a", "updatedAt": "2024-01-01T00:00:00Z"})).unwrap(),
            serde_json::from_value(json!({"id": "b"})).unwrap(),
        ];
        assert_eq!(most_recently_updated(&customers).unwrap().id.as_str(), "a");
    }
}
