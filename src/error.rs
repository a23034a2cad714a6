use thiserror::Error;

/// Hard failures surfaced to callers.
///
/// Invalid-state conditions (resolving an already-resolved exception) are
/// not errors; they come back as `ResolutionOutcome { success: false, .. }`
/// so UI-facing callers can render a message without treating them as
/// system faults.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("invoice {0} not found")]
    InvoiceNotFound(i64),

    #[error("exception {0} not found")]
    ExceptionNotFound(i64),

    #[error("no match result for invoice {0}")]
    MatchResultNotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}
