//! Error model shared by persistence collaborators.

use thiserror::Error;

/// Result type returned by lease and history stores.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence error kinds.
///
/// Stores translate their backend-specific failures into one of these kinds so
/// callers can branch on the kind instead of matching driver error codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic concurrency or invariant check rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend failed in a way that may succeed on retry (I/O, pool, timeout).
    #[error("transient storage failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Outer cancellation observed at a suspension point.
///
/// Distinct from any work failure: callers propagate it without retrying and
/// without logging it as an error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("operation cancelled")]
pub struct Cancelled;
