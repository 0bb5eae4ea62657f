//! Domain error model.

use thiserror::Error;

/// Result type returned by state-level rules (event validation, guards).
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// These are deterministic, business-rule failures raised while validating an event
/// against the state it targets. Storage, locking, and commit failures are modelled
/// in the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An event carried a value that is not acceptable (e.g. a non-positive amount).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Applying the event would break an invariant of the target state.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier or state key was malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The event targets state that must already exist but does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// The event conflicts with the current state (e.g. opening an open account).
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

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
