//! Customer/user link commands.
//!
//! # Usage
//!
//! ```bash
//! # Report what a repair sweep would change
//! ch-cli --snapshot store.json repair-links --dry-run
//!
//! # Apply it
//! ch-cli --snapshot store.json repair-links
//!
//! # Check one link, creating it if missing
//! ch-cli --snapshot store.json verify-link -c c1 -u u1 --link
//! ```

use std::path::Path;

use couponhub_core::{CustomerId, UserId};

use super::{CliError, Snapshot, log_report};

/// Sweep every linked customer and fix orphaned, duplicate, and half links.
pub async fn repair(path: &Path, dry_run: bool) -> Result<(), CliError> {
    let snapshot = Snapshot::load(path)?;
    let layer = snapshot.data_layer()?;

    let duplicates = layer.links().find_duplicate_links().await?;
    if !duplicates.is_empty() {
        tracing::warn!("{} users are claimed by more than one customer", duplicates.len());
        log_report("Duplicate links", &duplicates)?;
    }

    let report = layer.links().repair_all_broken_links(dry_run).await?;
    log_report("Link repair", &report)?;

    if !report.failed_groups.is_empty() {
        tracing::warn!("{} user groups could not be repaired", report.failed_groups.len());
    }

    if dry_run {
        tracing::info!("Dry run: {} documents would change", report.changes());
    } else if report.changes() > 0 {
        snapshot.save()?;
    }

    layer.shutdown();
    Ok(())
}

/// Report the state of one link, optionally linking both sides.
pub async fn verify(
    path: &Path,
    customer_id: &str,
    user_id: &str,
    link: bool,
) -> Result<(), CliError> {
    let snapshot = Snapshot::load(path)?;
    let layer = snapshot.data_layer()?;
    let customer_id = CustomerId::new(customer_id);
    let user_id = UserId::new(user_id);

    let status = layer.links().verify_customer_user_link(&customer_id, &user_id).await?;
    log_report("Link status", &status)?;

    if status.is_linked() {
        tracing::info!("Customer {customer_id} and user {user_id} are linked");
    } else if link {
        layer.links().link_customer_to_user(&customer_id, &user_id).await?;
        snapshot.save()?;
        tracing::info!("Linked customer {customer_id} to user {user_id}");
    } else if status.is_half_linked() {
        tracing::warn!("Half-linked: rerun with --link to fix");
    }

    layer.shutdown();
    Ok(())
}
