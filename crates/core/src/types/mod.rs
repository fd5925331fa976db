//! Core types for CouponHub.
//!
//! This module provides type-safe wrappers for common domain concepts and the
//! records stored in each collection.

pub mod coupon;
pub mod customer;
pub mod discount;
pub mod email;
pub mod id;
pub mod phone;
pub mod status;

pub use coupon::{Coupon, CouponDistribution, CustomerCoupon};
pub use customer::{Business, Customer, User};
pub use discount::{CurrencyCode, Discount, Price};
pub use email::{Email, EmailError};
pub use id::*;
pub use phone::{PhoneError, PhoneNumber, normalize_phone_number, phone_numbers_match, phone_variants};
pub use status::*;
