//! CouponHub Core - Shared types library.
//!
//! This crate provides common types used across all CouponHub components:
//! - `data` - Query, cache, and customer-linking layer over the document store
//! - `cli` - Maintenance tools (link repair, phone backfill, lookups)
//!
//! # Architecture
//!
//! The core crate contains only types and pure functions - no I/O, no store
//! access, no async runtime. This keeps it lightweight and allows it to be used
//! anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for document IDs, phone numbers, emails,
//!   discounts, statuses, and the document record shapes

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
