//! Error types for the reconciliation engine

use thiserror::Error;
use uuid::Uuid;

/// Reconciliation error type
///
/// Per-observation errors (`Validation`, `Classification`, `UpsertConflict`
/// during auto-apply) never abort a poll cycle; they are collected in the
/// cycle report. Queue-facing errors carry a reviewer-readable message.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Observation has no usable identity key; dropped before resolution
    #[error("Validation error: {0}")]
    Validation(String),

    /// The decision table has no outcome for this input
    #[error("Classification error: {0}")]
    Classification(String),

    /// A concurrent queue transition won the compare-and-swap; retryable
    #[error("Stale state: queue entry {entry_id} was changed by another reviewer (expected revision {expected}, found {actual})")]
    StaleState {
        entry_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Transition attempted from a state that does not allow it
    #[error("Invalid state transition for queue entry {entry_id}: cannot {action} an entry that is {status}")]
    InvalidStateTransition {
        entry_id: Uuid,
        status: String,
        action: &'static str,
    },

    /// Registry uniqueness violation discovered at commit time
    #[error("Upsert conflict: {0}")]
    UpsertConflict(String),

    /// Unknown queue entry, movement or device
    #[error("Not found: {0}")]
    NotFound(String),

    /// devrec-common error (database, IO, config)
    #[error(transparent)]
    Common(#[from] devrec_common::Error),
}

impl From<sqlx::Error> for ReconError {
    fn from(err: sqlx::Error) -> Self {
        ReconError::Common(devrec_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for ReconError {
    fn from(err: serde_json::Error) -> Self {
        ReconError::Common(devrec_common::Error::Serialization(err))
    }
}

impl ReconError {
    /// True when the caller may simply retry the same operation
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconError::StaleState { .. } => true,
            ReconError::Common(err) => err.is_database_locked(),
            _ => false,
        }
    }

    /// Short machine-readable code for logs and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            ReconError::Validation(_) => "VALIDATION",
            ReconError::Classification(_) => "CLASSIFICATION",
            ReconError::StaleState { .. } => "STALE_STATE",
            ReconError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            ReconError::UpsertConflict(_) => "UPSERT_CONFLICT",
            ReconError::NotFound(_) => "NOT_FOUND",
            ReconError::Common(_) => "INTERNAL",
        }
    }
}

/// Result type for engine operations
pub type ReconResult<T> = Result<T, ReconError>;
