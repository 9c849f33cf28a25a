//! Error types for the batch and certificate engine.

use thiserror::Error;

/// Errors returned by engine operations. Bulk issuance never surfaces these
/// per item; `issuance::IssuanceCoordinator` folds them into per-item
/// outcomes instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input failed shape validation (bad dates, out-of-range values).
    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation not allowed in the entity's current state.
    #[error("operation not allowed: {0}")]
    Precondition(String),

    /// Week completion or un-completion attempted out of sequential order.
    #[error("{0}")]
    SequenceViolation(String),

    /// Enrollment transition from the wrong status.
    #[error("invalid transition: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// External rendering/issuance collaborator failure. Retryable by the
    /// caller; issuance is idempotent-safe.
    #[error("issuer error: {0}")]
    Issuer(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
