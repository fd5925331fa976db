//! Integration tests for business discovery.
//!
//! Run with: cargo test -p couponhub-integration-tests --test business_discovery

#![allow(clippy::unwrap_used)]

use serde_json::json;

use couponhub_core::{BusinessId, CustomerId, UserId};
use couponhub_data::linking::{CustomerContext, DiscoveryOptions, DiscoverySource};
use couponhub_data::store::collections;
use couponhub_integration_tests::TestContext;

/// One person known to several businesses through different records.
fn connected_customer() -> TestContext {
    let ctx = TestContext::new();

    ctx.seed_business("b1", "active");
    ctx.seed_business("b2", "active");
    ctx.seed_business("b3", "suspended");

    ctx.seed_customer(
        "c1",
        json!({"phone": "083 209 1122", "businessId": "b1", "userId": "u1"}),
    );
    // Same person, kept by another business in a different format
    ctx.seed_customer(
        "c2",
        json!({"phone": "+27832091122", "phone_normalized": "0832091122", "businessId": "b4"}),
    );

    ctx.seed(
        collections::COUPON_DISTRIBUTIONS,
        "d1",
        json!({"couponId": "k5", "customerId": "c1", "businessId": "b5"}),
    );
    // No denormalized businessId: resolved through the coupon
    ctx.seed(collections::CUSTOMER_COUPONS, "cc1", json!({"customerId": "c1", "couponId": "k6"}));
    ctx.seed(
        collections::COUPONS,
        "k6",
        json!({"businessId": "b6", "title": "Free coffee", "status": "active"}),
    );
    ctx.seed(
        collections::CUSTOMER_COUPONS,
        "cc2",
        json!({"customerId": "c-old", "userId": "u1", "couponId": "k7", "businessId": "b7"}),
    );

    ctx
}

fn context() -> CustomerContext {
    CustomerContext {
        customer_id: Some(CustomerId::new("c1")),
        user_id: Some(UserId::new("u1")),
        phone: Some("083 209 1122".to_string()),
    }
}

fn business_ids(ids: &[&str]) -> Vec<BusinessId> {
    ids.iter().map(|id| BusinessId::new(*id)).collect()
}

#[tokio::test]
async fn test_discovery_unions_every_source() {
    let ctx = connected_customer();

    let report = ctx
        .layer
        .discovery()
        .discover_business_ids(&context(), DiscoveryOptions::default())
        .await;

    let found: Vec<BusinessId> = report.business_ids.iter().cloned().collect();
    assert_eq!(found, business_ids(&["b1", "b4", "b5", "b6", "b7"]));
    assert!(report.failed_sources.is_empty());
    assert_eq!(report.by_source.get(&DiscoverySource::CouponOwners), Some(&1));
    assert!(!report.by_source.contains_key(&DiscoverySource::ActiveBusinesses));
}

#[tokio::test]
async fn test_active_businesses_are_opt_in() {
    let ctx = connected_customer();
    let options = DiscoveryOptions {
        include_active_businesses: true,
    };

    let report = ctx.layer.discovery().discover_business_ids(&context(), options).await;

    assert!(report.business_ids.contains(&BusinessId::new("b2")));
    assert!(!report.business_ids.contains(&BusinessId::new("b3")));
}

#[tokio::test]
async fn test_failed_source_keeps_the_rest() {
    let ctx = connected_customer();
    ctx.store.fail_collection(collections::COUPON_DISTRIBUTIONS, "deadline exceeded");

    let report = ctx
        .layer
        .discovery()
        .discover_business_ids(&context(), DiscoveryOptions::default())
        .await;

    assert!(!report.business_ids.contains(&BusinessId::new("b5")));
    assert!(report.business_ids.contains(&BusinessId::new("b6")));
    assert!(
        report
            .failed_sources
            .iter()
            .any(|failure| failure.source == DiscoverySource::Distributions)
    );
    assert!(ctx.layer.monitor().get_performance_summary().errors >= 1);
}

#[tokio::test]
async fn test_phone_matches_survive_failed_follow_up() {
    let ctx = connected_customer();
    ctx.store.fail_collection(collections::COUPON_DISTRIBUTIONS, "deadline exceeded");
    let phone_only = CustomerContext {
        customer_id: None,
        user_id: None,
        phone: Some("083 209 1122".to_string()),
    };

    let report = ctx
        .layer
        .discovery()
        .discover_business_ids(&phone_only, DiscoveryOptions::default())
        .await;

    let found: Vec<BusinessId> = report.business_ids.iter().cloned().collect();
    assert_eq!(found, business_ids(&["b1", "b4", "b6"]));
    assert_eq!(report.failed_sources.len(), 1);
    assert_eq!(report.failed_sources[0].source, DiscoverySource::PhoneMatches);
}
