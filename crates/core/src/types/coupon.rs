//! Coupon documents: definitions, per-customer assignments, and distributions.
//!
//! Field names follow the stored documents (`camelCase`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::discount::Discount;
use super::id::{BusinessId, CouponId, CustomerCouponId, CustomerId, DistributionId, UserId};
use super::status::{CouponStatus, CustomerCouponStatus};

/// A coupon defined by a business (`coupons` collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub id: CouponId,
    pub business_id: BusinessId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub status: CouponStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<Discount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Coupon {
    /// Returns `true` if the coupon has an expiry date at or before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// A coupon assigned to one customer (`customerCoupons` collection).
///
/// Older assignments only carry `customerId`; newer ones written after the
/// customer signed in also carry `userId`. `businessId` is denormalized and
/// missing on records created before it was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCoupon {
    pub id: CustomerCouponId,
    pub customer_id: CustomerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub coupon_id: CouponId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_id: Option<BusinessId>,
    #[serde(default)]
    pub status: CustomerCouponStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// A record that a business sent a coupon to a customer
/// (`couponDistributions` collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponDistribution {
    pub id: DistributionId,
    pub coupon_id: CouponId,
    pub customer_id: CustomerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_id: Option<BusinessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_coupon_minimal_document() {
        let json = serde_json::json!({
            "id": "cc1",
            "customerId": "c1",
            "couponId": "k1"
        });
        let record: CustomerCoupon = serde_json::from_value(json).unwrap();
        assert_eq!(record.status, CustomerCouponStatus::Active);
        assert!(record.user_id.is_none());
        assert!(record.business_id.is_none());
    }

    #[test]
    fn test_coupon_expiry() {
        let now = Utc::now();
        let coupon = Coupon {
            id: CouponId::new("k1"),
            business_id: BusinessId::new("b1"),
            title: "Free coffee".to_string(),
            code: None,
            status: CouponStatus::Active,
            discount: None,
            expires_at: Some(now),
            created_at: None,
            updated_at: None,
        };
        assert!(coupon.is_expired_at(now));
        assert!(!coupon.is_expired_at(now - chrono::Duration::seconds(1)));
    }
}
