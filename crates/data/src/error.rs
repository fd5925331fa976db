//! Unified error type for the data layer.
//!
//! Store-level failures are wrapped rather than flattened so callers can still
//! match on the underlying [`StoreError`]. Best-effort paths (cache
//! persistence, individual discovery sources) log and degrade instead of
//! returning these.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by data-layer services.
#[derive(Debug, Error)]
pub enum DataError {
    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested document was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DataError {
    /// Returns `true` if retrying the same call may succeed.
    ///
    /// Only transient store unavailability qualifies. Missing indexes, invalid
    /// queries, and malformed documents need a code or data fix.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

/// Result type alias for `DataError`.
pub type Result<T> = std::result::Result<T, DataError>;
