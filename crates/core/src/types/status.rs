//! Status enums for coupons, assignments, and businesses.
//!
//! Stored as lower-case strings on the documents (`"active"`, `"redeemed"`).

use serde::{Deserialize, Serialize};

/// Lifecycle of a coupon definition owned by a business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    /// Created but not yet distributed.
    #[default]
    Draft,
    /// Available for distribution and redemption.
    Active,
    /// Paused by the business owner.
    Inactive,
    /// Past its expiry date.
    Expired,
}

/// State of a coupon assigned to a specific customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CustomerCouponStatus {
    #[default]
    Active,
    Redeemed,
    Expired,
}

/// Whether a business account is operating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    #[default]
    Active,
    Suspended,
    Closed,
}

macro_rules! impl_status_strings {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The string stored on documents.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("invalid ", stringify!($name), ": {}"), s)),
                }
            }
        }
    };
}

impl_status_strings!(CouponStatus {
    Draft => "draft",
    Active => "active",
    Inactive => "inactive",
    Expired => "expired",
});

impl_status_strings!(CustomerCouponStatus {
    Active => "active",
    Redeemed => "redeemed",
    Expired => "expired",
});

impl_status_strings!(BusinessStatus {
    Active => "active",
    Suspended => "suspended",
    Closed => "closed",
});
