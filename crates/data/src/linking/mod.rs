//! Customer, user, and business linking.
//!
//! - [`CustomerLookup`] - Resolve customers by phone (any stored format),
//!   email, or user account
//! - [`BusinessDiscovery`] - Union the businesses a customer is connected to
//! - [`LinkVerifier`] - Check, create, and repair customer/user links

mod discovery;
mod lookup;
mod repair;

pub use discovery::{
    BusinessDiscovery, CustomerContext, DiscoveryOptions, DiscoveryReport, DiscoverySource,
    SourceFailure,
};
pub use lookup::{CustomerLookup, MatchedBy, ResolvedCustomer};
pub use repair::{DuplicateLink, GroupFailure, LinkStatus, LinkVerifier, RepairReport};
