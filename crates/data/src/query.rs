//! Index-aware query construction.
//!
//! The hosted store serves a compound query from a composite index whose
//! leading fields are the equality fields, followed by the single range or
//! ordering field. [`build_compound_query`] always emits clauses in that
//! order so that one index per filter shape suffices:
//!
//! 1. equality filters
//! 2. range filters
//! 3. `order by`
//! 4. `start after` cursor
//! 5. limit
//!
//! Index existence is not checked here. A query without a matching index
//! fails when it runs, with [`StoreError::MissingIndex`].
//!
//! [`StoreError::MissingIndex`]: crate::store::StoreError::MissingIndex

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use couponhub_core::normalize_phone_number;

use crate::store::{Cursor, DOCUMENT_ID_FIELD, FilterOp, MAX_IN_VALUES, OrderDirection, Query};

/// Default number of IDs per batched lookup.
pub const DEFAULT_ID_BATCH_SIZE: usize = 10;

/// Default page size for compound queries.
pub const DEFAULT_MAX_RESULTS: usize = 20;

/// A filter value: plain equality, or an operator with a value.
///
/// Serialized as either the bare value or `{"operator": ">", "value": 0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Range { operator: FilterOp, value: Value },
    Equals(Value),
}

impl FilterValue {
    /// Shorthand for a range filter.
    #[must_use]
    pub fn range(operator: FilterOp, value: impl Into<Value>) -> Self {
        Self::Range {
            operator,
            value: value.into(),
        }
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        Self::Equals(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Equals(Value::String(value.to_owned()))
    }
}

/// Filters keyed by field name. Ordered so that equal filter maps produce
/// identical queries and cache keys.
pub type QueryFilters = BTreeMap<String, FilterValue>;

/// Build a compound query with clauses in index order.
///
/// Equality filters whose value is `null` are treated as unset and skipped.
/// A `Range` filter with the `==` operator counts as an equality filter.
#[must_use]
pub fn build_compound_query(
    collection: &str,
    filters: &QueryFilters,
    order_field: Option<&str>,
    order_direction: OrderDirection,
    max_results: usize,
    last_doc: Option<&Cursor>,
) -> Query {
    let mut equality = Vec::new();
    let mut ranges = Vec::new();

    for (field, filter) in filters {
        match filter {
            FilterValue::Equals(Value::Null) => {}
            FilterValue::Equals(value) => equality.push((field, FilterOp::Equal, value)),
            FilterValue::Range { operator, value } if operator.is_range() => {
                ranges.push((field, *operator, value));
            }
            FilterValue::Range { operator, value } => equality.push((field, *operator, value)),
        }
    }

    let mut query = Query::new(collection);
    for (field, op, value) in equality.into_iter().chain(ranges) {
        query = query.filter(field.as_str(), op, value.clone());
    }
    if let Some(field) = order_field {
        query = query.order_by(field, order_direction);
    }
    if let Some(cursor) = last_doc {
        query = query.start_after(cursor.clone());
    }
    query.limit(max_results)
}

/// Split `ids` into `in` queries on the document ID, `batch_size` IDs each.
///
/// `batch_size` is clamped to `1..=30`. Callers merge the results.
#[must_use]
pub fn create_batched_id_query<S: AsRef<str>>(
    collection: &str,
    ids: &[S],
    batch_size: usize,
) -> Vec<Query> {
    let batch_size = batch_size.clamp(1, MAX_IN_VALUES);
    ids.chunks(batch_size)
        .map(|chunk| {
            let values: Vec<Value> = chunk
                .iter()
                .map(|id| Value::String(id.as_ref().to_owned()))
                .collect();
            Query::new(collection).filter(DOCUMENT_ID_FIELD, FilterOp::In, values)
        })
        .collect()
}
