use thiserror::Error;

use crate::types::OverrideStatus;

/// Errors that can occur during override operations.
#[derive(Debug, Error)]
pub enum OverrideError {
    /// No override with this id exists. Approve/reject never create one.
    #[error("override not found: {id}")]
    NotFound { id: String },

    /// The override already left `pending`; decided overrides are final.
    #[error("override {id} is already {status}")]
    AlreadyDecided { id: String, status: OverrideStatus },

    /// Malformed input; nothing was written.
    #[error("invalid override: {0}")]
    Validation(String),

    /// The caller cancelled the operation before the write was issued.
    #[error("override operation cancelled")]
    Cancelled,

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl OverrideError {
    pub fn code(&self) -> &'static str {
        match self {
            OverrideError::NotFound { .. } => "NOT_FOUND",
            OverrideError::AlreadyDecided { .. } => "ALREADY_DECIDED",
            OverrideError::Validation(_) => "VALIDATION_ERROR",
            OverrideError::Cancelled => "CANCELLED",
            OverrideError::Database(_) => "STORE_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, OverrideError>;
