//! Data migration commands.
//!
//! # Usage
//!
//! ```bash
//! # Count customers missing phone_normalized
//! ch-cli --snapshot store.json migrate phones --dry-run
//!
//! # Write phone_normalized
//! ch-cli --snapshot store.json migrate phones
//! ```
//!
//! The phone backfill is idempotent: customers already carrying the right
//! normalized value are skipped.

use std::path::Path;

use couponhub_data::migration::backfill_normalized_phones;

use super::{CliError, Snapshot, log_report};

/// Backfill `customers.phone_normalized`.
pub async fn phones(path: &Path, dry_run: bool) -> Result<(), CliError> {
    let snapshot = Snapshot::load(path)?;

    tracing::info!("Backfilling normalized phone numbers...");
    let report = backfill_normalized_phones(snapshot.store().as_ref(), dry_run).await?;
    log_report("Phone backfill", &report)?;

    if !dry_run && report.batches_committed > 0 {
        snapshot.save()?;
    }
    Ok(())
}
