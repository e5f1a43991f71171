//! Error types for the tide document layer
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for tide operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the tide document layer
#[derive(Debug, Error)]
pub enum Error {
    /// Document or attached document absent, or soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// Revision mismatch on write (optimistic concurrency)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Attached bulk write failed after the configured retry budget
    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Total attempts consumed (retries + 1)
        attempts: usize,
    },

    /// Rejected before any store interaction (reserved field name,
    /// malformed attached ids, unsupported condition operand)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Opaque failure from the underlying store
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Build a NotFound error for a document id
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Build a Conflict error
    pub fn conflict(what: impl Into<String>) -> Self {
        Error::Conflict(what.into())
    }

    /// Build a Validation error
    pub fn validation(what: impl Into<String>) -> Self {
        Error::Validation(what.into())
    }

    /// True if this error is a NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True if this error is a Conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
