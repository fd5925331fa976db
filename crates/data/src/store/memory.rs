//! In-process document store.
//!
//! Evaluates compound queries with the hosted store's rules:
//!
//! - Documents missing a filtered or ordered field never match
//! - Range filters (`<`, `<=`, `>`, `>=`, `!=`) may target only one field, and
//!   the first `order by` must be on that field
//! - `in` filters take 1-30 values
//! - Results are ordered by the `order by` clauses, then by document ID
//!
//! Composite-index enforcement is off by default. When enabled with
//! [`InMemoryStore::require_indexes`], a query combining equality filters with
//! a range filter or ordering on another field fails with
//! [`StoreError::MissingIndex`] unless a matching index was declared.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::value;
use super::{
    DOCUMENT_ID_FIELD, Document, DocumentStore, Fields, FilterOp, MAX_BATCH_WRITES, MAX_IN_VALUES,
    OrderDirection, Query, StoreError, WriteBatch, WriteOp,
};

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

/// Serializable contents of an [`InMemoryStore`].
///
/// On disk: `{"collections": {"customers": {"c1": {...fields}}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub collections: Collections,
}

#[derive(Debug, Clone)]
struct CompositeIndex {
    collection: String,
    fields: BTreeSet<String>,
}

/// Document store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<Collections>,
    indexes: RwLock<Option<Vec<CompositeIndex>>>,
    failures: RwLock<HashMap<String, String>>,
    queries_run: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            collections: RwLock::new(snapshot.collections),
            ..Self::default()
        }
    }

    /// Load a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file cannot be read, or
    /// `StoreError::Serialization` if it is not a valid snapshot.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
        debug!(
            path = %path.display(),
            collections = snapshot.collections.len(),
            "Loaded store snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write the current contents to a snapshot file.
    ///
    /// Writes to a sibling temporary file first and renames it into place.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` or `StoreError::Serialization` on failure.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            collections: self.collections.read().clone(),
        }
    }

    /// Insert or replace a document directly, bypassing batches.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if `value` is not a JSON object.
    pub fn seed(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = value else {
            return Err(StoreError::Serialization(serde::de::Error::custom(
                "document must be a JSON object",
            )));
        };
        self.collections
            .write()
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), fields);
        Ok(())
    }

    /// Read a document without going through the async trait.
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone()))
    }

    /// Number of queries executed so far.
    #[must_use]
    pub fn queries_run(&self) -> usize {
        self.queries_run.load(AtomicOrdering::Relaxed)
    }

    /// Turn on composite-index enforcement.
    pub fn require_indexes(&self) {
        let mut indexes = self.indexes.write();
        if indexes.is_none() {
            *indexes = Some(Vec::new());
        }
    }

    /// Declare a composite index. Implies [`Self::require_indexes`].
    pub fn add_index(&self, collection: &str, fields: &[&str]) {
        let index = CompositeIndex {
            collection: collection.to_owned(),
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
        };
        self.indexes.write().get_or_insert_with(Vec::new).push(index);
    }

    /// Make every read of `collection` fail with `StoreError::Unavailable`.
    pub fn fail_collection(&self, collection: &str, message: &str) {
        self.failures
            .write()
            .insert(collection.to_owned(), message.to_owned());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    fn check_available(&self, collection: &str) -> Result<(), StoreError> {
        match self.failures.read().get(collection) {
            Some(message) => Err(StoreError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn check_index(&self, query: &Query) -> Result<(), StoreError> {
        let indexes = self.indexes.read();
        let Some(declared) = indexes.as_ref() else {
            return Ok(());
        };
        let Some(required) = required_index(query) else {
            return Ok(());
        };

        let wanted: BTreeSet<String> = required.iter().cloned().collect();
        let found = declared
            .iter()
            .any(|idx| idx.collection == query.collection && idx.fields == wanted);

        if found {
            Ok(())
        } else {
            Err(StoreError::MissingIndex {
                collection: query.collection.clone(),
                fields: required,
            })
        }
    }

    fn execute(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.check_available(&query.collection)?;
        validate(query)?;
        self.check_index(query)?;
        self.queries_run.fetch_add(1, AtomicOrdering::Relaxed);

        let orderings: Vec<(&str, OrderDirection)> = query.orderings().collect();

        let mut results: Vec<Document> = {
            let collections = self.collections.read();
            let Some(docs) = collections.get(&query.collection) else {
                return Ok(Vec::new());
            };
            docs.iter()
                .map(|(id, fields)| Document::new(id.as_str(), fields.clone()))
                .filter(|doc| {
                    query
                        .filters()
                        .all(|(field, op, expected)| matches_filter(doc, field, op, expected))
                })
                .filter(|doc| orderings.iter().all(|(field, _)| doc.field(field).is_some()))
                .collect()
        };

        results.sort_by(|a, b| compare_docs(a, b, &orderings));

        if let Some(cursor) = query.cursor() {
            results.retain(|doc| {
                compare_to_cursor(doc, &cursor.id, &cursor.values, &orderings) == Ordering::Greater
            });
        }

        if let Some(limit) = query.limit_count() {
            results.truncate(limit);
        }

        Ok(results)
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }

        let mut collections = self.collections.write();

        // Validate every update against the state the batch would produce
        // before mutating anything.
        let mut overlay: HashMap<(&str, &str), bool> = HashMap::new();
        for op in batch.ops() {
            match op {
                WriteOp::Set { collection, id, .. } => {
                    overlay.insert((collection.as_str(), id.as_str()), true);
                }
                WriteOp::Delete { collection, id } => {
                    overlay.insert((collection.as_str(), id.as_str()), false);
                }
                WriteOp::Update { collection, id, .. } => {
                    let exists = overlay
                        .get(&(collection.as_str(), id.as_str()))
                        .copied()
                        .unwrap_or_else(|| {
                            collections
                                .get(collection)
                                .is_some_and(|docs| docs.contains_key(id))
                        });
                    if !exists {
                        return Err(StoreError::NotFound {
                            collection: collection.clone(),
                            id: id.clone(),
                        });
                    }
                }
            }
        }
        drop(overlay);

        for op in batch.into_ops() {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    fields,
                } => {
                    collections.entry(collection).or_default().insert(id, fields);
                }
                WriteOp::Update {
                    collection,
                    id,
                    fields,
                } => {
                    if let Some(doc) = collections
                        .get_mut(&collection)
                        .and_then(|docs| docs.get_mut(&id))
                    {
                        doc.extend(fields);
                    }
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&id);
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_available(collection)?;
        Ok(self.document(collection, id))
    }

    #[instrument(skip(self, query), fields(collection = %query.collection))]
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let results = self.execute(query)?;
        debug!(results = results.len(), "Query executed");
        Ok(results)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let writes = batch.len();
        self.apply(batch)?;
        debug!(writes, "Batch committed");
        Ok(())
    }
}

fn validate(query: &Query) -> Result<(), StoreError> {
    let mut range_field: Option<&str> = None;

    for (field, op, value) in query.filters() {
        if op.is_range() {
            match range_field {
                Some(existing) if existing != field => {
                    return Err(StoreError::InvalidQuery(format!(
                        "range filters on both '{existing}' and '{field}'"
                    )));
                }
                _ => range_field = Some(field),
            }
        }

        if op == FilterOp::In {
            match value {
                Value::Array(items) if items.is_empty() => {
                    return Err(StoreError::InvalidQuery(format!(
                        "'in' filter on '{field}' needs at least one value"
                    )));
                }
                Value::Array(items) if items.len() > MAX_IN_VALUES => {
                    return Err(StoreError::InvalidQuery(format!(
                        "'in' filter on '{field}' has {} values (max {MAX_IN_VALUES})",
                        items.len()
                    )));
                }
                Value::Array(_) => {}
                _ => {
                    return Err(StoreError::InvalidQuery(format!(
                        "'in' filter on '{field}' needs an array"
                    )));
                }
            }
        }
    }

    if let (Some(range), Some((first_order, _))) = (range_field, query.orderings().next())
        && range != first_order
    {
        return Err(StoreError::InvalidQuery(format!(
            "first order by must be on range field '{range}', not '{first_order}'"
        )));
    }

    Ok(())
}

/// Fields of the composite index a query needs, equality fields first.
fn required_index(query: &Query) -> Option<Vec<String>> {
    let equality: BTreeSet<&str> = query
        .filters()
        .filter(|(field, op, _)| !op.is_range() && *field != DOCUMENT_ID_FIELD)
        .map(|(field, _, _)| field)
        .collect();

    let mut trailing: Vec<&str> = Vec::new();
    let range = query.filters().find(|(_, op, _)| op.is_range()).map(|(f, _, _)| f);
    for field in range.into_iter().chain(query.orderings().map(|(f, _)| f)) {
        if field != DOCUMENT_ID_FIELD && !trailing.contains(&field) && !equality.contains(field) {
            trailing.push(field);
        }
    }

    let needs_composite = (!equality.is_empty() && !trailing.is_empty()) || trailing.len() > 1;
    needs_composite.then(|| {
        equality
            .into_iter()
            .chain(trailing)
            .map(str::to_owned)
            .collect()
    })
}

fn matches_filter(doc: &Document, field: &str, op: FilterOp, expected: &Value) -> bool {
    let Some(actual) = doc.field(field) else {
        return false;
    };

    let range = |wanted: &[Ordering]| {
        value::same_kind(&actual, expected) && wanted.contains(&value::compare(&actual, expected))
    };

    match op {
        FilterOp::Equal => value::equal(&actual, expected),
        FilterOp::NotEqual => !actual.is_null() && !value::equal(&actual, expected),
        FilterOp::LessThan => range(&[Ordering::Less]),
        FilterOp::LessThanOrEqual => range(&[Ordering::Less, Ordering::Equal]),
        FilterOp::GreaterThan => range(&[Ordering::Greater]),
        FilterOp::GreaterThanOrEqual => range(&[Ordering::Greater, Ordering::Equal]),
        FilterOp::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| value::equal(&actual, item))),
    }
}

fn directed(ord: Ordering, direction: OrderDirection) -> Ordering {
    match direction {
        OrderDirection::Ascending => ord,
        OrderDirection::Descending => ord.reverse(),
    }
}

fn compare_docs(a: &Document, b: &Document, orderings: &[(&str, OrderDirection)]) -> Ordering {
    for (field, direction) in orderings {
        let left = a.field(field).unwrap_or(Value::Null);
        let right = b.field(field).unwrap_or(Value::Null);
        let ord = directed(value::compare(&left, &right), *direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

fn compare_to_cursor(
    doc: &Document,
    cursor_id: &str,
    cursor_values: &[Value],
    orderings: &[(&str, OrderDirection)],
) -> Ordering {
    for (idx, (field, direction)) in orderings.iter().enumerate() {
        let left = doc.field(field).unwrap_or(Value::Null);
        let right = cursor_values.get(idx).unwrap_or(&Value::Null);
        let ord = directed(value::compare(&left, right), *direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    doc.id.as_str().cmp(cursor_id)
}
