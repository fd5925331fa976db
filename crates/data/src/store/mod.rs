//! Document store seam.
//!
//! # Model
//!
//! The backing store is schemaless: named collections of documents keyed by
//! string IDs, each document a JSON object. Queries are lists of
//! [`QueryConstraint`]s applied in order (filters, ordering, cursor, limit),
//! matching the compound-query shape the hosted store accepts.
//!
//! # Implementations
//!
//! - [`InMemoryStore`] - Query evaluation over in-process maps, JSON snapshot
//!   load/save, optional composite-index enforcement and fault injection
//!
//! # Collections
//!
//! See [`collections`] and [`fields`] for the names every query in this crate
//! relies on.

mod memory;
mod value;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::{InMemoryStore, StoreSnapshot};

/// Field path that addresses the document ID instead of a stored field.
pub const DOCUMENT_ID_FIELD: &str = "__name__";

/// Maximum number of values in a single `in` filter.
pub const MAX_IN_VALUES: usize = 30;

/// Maximum number of writes in a single [`WriteBatch`].
pub const MAX_BATCH_WRITES: usize = 500;

/// Collection names.
pub mod collections {
    pub const COUPONS: &str = "coupons";
    pub const CUSTOMER_COUPONS: &str = "customerCoupons";
    pub const COUPON_DISTRIBUTIONS: &str = "couponDistributions";
    pub const CUSTOMERS: &str = "customers";
    pub const BUSINESSES: &str = "businesses";
    pub const USERS: &str = "users";
}

/// Field names shared across collections.
pub mod fields {
    pub const BUSINESS_ID: &str = "businessId";
    pub const COUPON_ID: &str = "couponId";
    pub const CUSTOMER_ID: &str = "customerId";
    pub const USER_ID: &str = "userId";
    pub const LINKED_CUSTOMER_ID: &str = "linkedCustomerId";
    pub const PHONE: &str = "phone";
    pub const PHONE_NORMALIZED: &str = "phone_normalized";
    pub const EMAIL: &str = "email";
    pub const STATUS: &str = "status";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// The fields of a stored document.
pub type Fields = serde_json::Map<String, Value>;

/// Errors returned by a [`DocumentStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// An update targeted a document that does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Document ID.
        id: String,
    },

    /// The query needs a composite index that has not been created.
    #[error("query on {collection} requires a composite index on ({})", .fields.join(", "))]
    MissingIndex {
        /// Collection name.
        collection: String,
        /// Indexed fields, equality fields first.
        fields: Vec<String>,
    },

    /// The query violates the store's query rules.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write batch exceeded [`MAX_BATCH_WRITES`].
    #[error("write batch has {0} operations (max {MAX_BATCH_WRITES})")]
    BatchTooLarge(usize),

    /// Reading or writing a snapshot file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot file or document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A document read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document ID within its collection.
    pub id: String,
    /// Stored fields.
    pub fields: Fields,
}

impl Document {
    /// Create a document from an ID and its fields.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a field, treating [`DOCUMENT_ID_FIELD`] as the document ID.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == DOCUMENT_ID_FIELD {
            return Some(Value::String(self.id.clone()));
        }
        self.fields.get(name).cloned()
    }

    /// Look up a string field.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Deserialize the document into a record type.
    ///
    /// The document ID is exposed to the record as an `id` field.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the fields do not match the record shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut map = self.fields.clone();
        map.insert("id".to_owned(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(map))
    }

    /// Build a pagination cursor positioned at this document.
    #[must_use]
    pub fn cursor(&self, order_fields: &[&str]) -> Cursor {
        Cursor {
            id: self.id.clone(),
            values: order_fields
                .iter()
                .map(|field| self.field(field).unwrap_or(Value::Null))
                .collect(),
        }
    }
}

/// Serialize a record into document fields, dropping its `id`.
///
/// # Errors
///
/// Returns `serde_json::Error` if the record does not serialize to an object.
pub fn encode_fields<T: Serialize>(record: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(mut map) => {
            map.remove("id");
            Ok(map)
        }
        other => Err(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Comparison operator in a `where` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "in")]
    In,
}

impl FilterOp {
    /// Range operators constrain index order and must come after equality
    /// clauses.
    #[must_use]
    pub const fn is_range(self) -> bool {
        matches!(
            self,
            Self::NotEqual
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::In => "in",
        };
        f.write_str(op)
    }
}

/// Sort direction for an `order by` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

/// Position after which a paginated query resumes.
///
/// Holds the last document's ID and its values for each `order by` field, in
/// clause order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub id: String,
    pub values: Vec<Value>,
}

/// One clause of a compound query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryConstraint {
    Where {
        field: String,
        op: FilterOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: OrderDirection,
    },
    StartAfter {
        cursor: Cursor,
    },
    Limit {
        count: usize,
    },
}

/// A compound query against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub constraints: Vec<QueryConstraint>,
}

impl Query {
    /// Start a query over `collection` with no constraints.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            constraints: Vec::new(),
        }
    }

    /// Append a `where` clause.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.constraints.push(QueryConstraint::Where {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Append an equality clause.
    #[must_use]
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Equal, value)
    }

    /// Append an `order by` clause.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.constraints.push(QueryConstraint::OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Resume after `cursor`.
    #[must_use]
    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.constraints.push(QueryConstraint::StartAfter { cursor });
        self
    }

    /// Cap the number of results.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.constraints.push(QueryConstraint::Limit { count });
        self
    }

    /// The `where` clauses, in order.
    pub fn filters(&self) -> impl Iterator<Item = (&str, FilterOp, &Value)> {
        self.constraints.iter().filter_map(|c| match c {
            QueryConstraint::Where { field, op, value } => Some((field.as_str(), *op, value)),
            _ => None,
        })
    }

    /// The `order by` clauses, in order.
    pub fn orderings(&self) -> impl Iterator<Item = (&str, OrderDirection)> {
        self.constraints.iter().filter_map(|c| match c {
            QueryConstraint::OrderBy { field, direction } => Some((field.as_str(), *direction)),
            _ => None,
        })
    }

    /// The last `start after` cursor, if any.
    #[must_use]
    pub fn cursor(&self) -> Option<&Cursor> {
        self.constraints.iter().rev().find_map(|c| match c {
            QueryConstraint::StartAfter { cursor } => Some(cursor),
            _ => None,
        })
    }

    /// The last `limit`, if any.
    #[must_use]
    pub fn limit_count(&self) -> Option<usize> {
        self.constraints.iter().rev().find_map(|c| match c {
            QueryConstraint::Limit { count } => Some(*count),
            _ => None,
        })
    }
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace a document.
    Set {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Merge fields into an existing document. Fails if it does not exist.
    Update {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Delete a document (no-op if missing).
    Delete { collection: String, id: String },
}

/// Writes applied atomically by [`DocumentStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a document.
    pub fn set(&mut self, collection: &str, id: &str, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection: collection.to_owned(),
            id: id.to_owned(),
            fields,
        });
        self
    }

    /// Merge fields into an existing document.
    pub fn update(&mut self, collection: &str, id: &str, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection: collection.to_owned(),
            id: id.to_owned(),
            fields,
        });
        self
    }

    /// Delete a document.
    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.to_owned(),
            id: id.to_owned(),
        });
        self
    }

    /// Number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if no writes are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The queued writes, in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch and return its writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Access to the document store.
///
/// Implementations must be shareable across tasks; services hold an
/// `Arc<dyn DocumentStore>`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document by ID.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Run a compound query.
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Apply all writes in the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

impl std::fmt::Debug for dyn DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn DocumentStore")
    }
}
