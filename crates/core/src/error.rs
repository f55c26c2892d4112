//! Domain error model.
//!
//! Domain errors represent deterministic business failures: validation
//! errors, invariant violations, conflicts. Infrastructure failures (store
//! unavailable, network errors) belong to the store and engine layers.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error (deterministic business failures).
///
/// Errors are `Clone` and `PartialEq` so tests can compare them directly
/// and callers can carry them across task boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (malformed input, out-of-range field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A scheduling invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested record was not found.
    #[error("not found")]
    NotFound,

    /// A conflicting state transition was requested (e.g. cancelling a
    /// terminal job).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
