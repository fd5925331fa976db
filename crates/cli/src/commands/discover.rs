//! Business discovery command.

use std::path::Path;

use couponhub_core::{CustomerId, UserId};
use couponhub_data::linking::{CustomerContext, DiscoveryOptions};

use super::{CliError, Snapshot, log_report};

/// Print every business connected to the given customer identifiers.
pub async fn run(
    path: &Path,
    customer_id: Option<String>,
    user_id: Option<String>,
    phone: Option<String>,
    include_active: bool,
) -> Result<(), CliError> {
    let context = CustomerContext {
        customer_id: customer_id.map(CustomerId::new),
        user_id: user_id.map(UserId::new),
        phone,
    };
    if context == CustomerContext::default() && !include_active {
        return Err(CliError::InvalidArguments(
            "give at least one of --customer-id, --user-id, --phone, --include-active".to_owned(),
        ));
    }

    let layer = Snapshot::load(path)?.data_layer()?;
    let options = DiscoveryOptions {
        include_active_businesses: include_active,
    };

    let report = layer.discovery().discover_business_ids(&context, options).await;
    log_report("Discovered businesses", &report)?;

    for failure in &report.failed_sources {
        tracing::warn!("Source {} failed: {}", failure.source, failure.error);
    }

    layer.shutdown();
    Ok(())
}
