//! Customer lookup commands.

use std::path::Path;

use couponhub_core::UserId;

use super::{CliError, Snapshot, log_report};

pub async fn by_phone(path: &Path, phone: &str) -> Result<(), CliError> {
    let layer = Snapshot::load(path)?.data_layer()?;

    let customers = layer.lookup().find_customers_by_phone(phone).await?;
    tracing::info!("{} customers match {phone}", customers.len());
    log_report("Customers", &customers)?;

    if let Some(indexed) = layer.coupons().find_customer_by_phone_optimized(phone).await? {
        tracing::info!("Indexed lookup (phone_normalized) returns {}", indexed.id);
    } else if !customers.is_empty() {
        tracing::warn!("No indexed match: run `migrate phones` to backfill phone_normalized");
    }

    layer.shutdown();
    Ok(())
}

pub async fn by_email(path: &Path, email: &str) -> Result<(), CliError> {
    let layer = Snapshot::load(path)?.data_layer()?;

    match layer.lookup().find_customer_by_email(email).await? {
        Some(customer) => log_report("Customer", &customer)?,
        None => tracing::info!("No customer with email {email}"),
    }

    layer.shutdown();
    Ok(())
}

pub async fn by_user(path: &Path, user_id: &str) -> Result<(), CliError> {
    let layer = Snapshot::load(path)?.data_layer()?;

    match layer.lookup().find_customer_for_user(&UserId::new(user_id)).await? {
        Some(resolved) => log_report("Customer", &resolved)?,
        None => tracing::info!("No customer found for user {user_id}"),
    }

    layer.shutdown();
    Ok(())
}
