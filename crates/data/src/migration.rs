//! One-off data migrations.
//!
//! [`backfill_normalized_phones`] populates `customers.phone_normalized`, which
//! [`OptimizedCouponService::find_customer_by_phone_optimized`] queries on.
//! Customers are read in pages ordered by document ID and updated in write
//! batches of at most 500 operations, so the migration can be re-run safely:
//! customers already carrying the right value are skipped. Phones that do not
//! parse as a [`PhoneNumber`] are counted and left alone.
//!
//! [`OptimizedCouponService::find_customer_by_phone_optimized`]: crate::coupons::OptimizedCouponService::find_customer_by_phone_optimized

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use couponhub_core::PhoneNumber;

use crate::error::Result;
use crate::store::{
    DOCUMENT_ID_FIELD, DocumentStore, MAX_BATCH_WRITES, OrderDirection, Query, WriteBatch,
    collections, encode_fields, fields,
};

/// Outcome of [`backfill_normalized_phones`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub scanned: usize,
    /// Customers whose `phone_normalized` was written (or would be).
    pub updated: usize,
    pub already_current: usize,
    pub without_phone: usize,
    /// Customers whose phone contains something other than digits and
    /// separators.
    pub invalid_phone: usize,
    pub batches_committed: usize,
}

/// Write `phone_normalized` for every customer where it is missing or stale.
///
/// # Errors
///
/// Returns the store error if a page read or batch commit fails. Batches
/// committed before the failure stay applied.
#[instrument(skip(store))]
pub async fn backfill_normalized_phones(
    store: &dyn DocumentStore,
    dry_run: bool,
) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        dry_run,
        ..MigrationReport::default()
    };
    let mut cursor = None;

    loop {
        let mut query = Query::new(collections::CUSTOMERS)
            .order_by(DOCUMENT_ID_FIELD, OrderDirection::Ascending)
            .limit(MAX_BATCH_WRITES);
        if let Some(after) = cursor.take() {
            query = query.start_after(after);
        }

        let page = store.run_query(&query).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last.cursor(&[DOCUMENT_ID_FIELD]));
        report.scanned += page.len();

        let mut batch = WriteBatch::new();
        for doc in &page {
            let Some(phone) = doc.str_field(fields::PHONE).filter(|p| !p.trim().is_empty()) else {
                report.without_phone += 1;
                continue;
            };

            let normalized = match PhoneNumber::parse(phone) {
                Ok(parsed) => parsed.into_inner(),
                Err(e) => {
                    warn!(customer_id = %doc.id, error = %e, "Skipping customer with unparseable phone");
                    report.invalid_phone += 1;
                    continue;
                }
            };
            if doc.str_field(fields::PHONE_NORMALIZED) == Some(normalized.as_str()) {
                report.already_current += 1;
                continue;
            }

            batch.update(
                collections::CUSTOMERS,
                &doc.id,
                encode_fields(&json!({ fields::PHONE_NORMALIZED: normalized }))?,
            );
        }

        report.updated += batch.len();
        if !batch.is_empty() && !dry_run {
            store.commit(batch).await?;
            report.batches_committed += 1;
        }
        debug!(scanned = report.scanned, updated = report.updated, "Backfill page done");

        if page.len() < MAX_BATCH_WRITES {
            break;
        }
    }

    info!(
        dry_run,
        scanned = report.scanned,
        updated = report.updated,
        invalid = report.invalid_phone,
        batches = report.batches_committed,
        "Phone backfill finished"
    );
    Ok(report)
}
