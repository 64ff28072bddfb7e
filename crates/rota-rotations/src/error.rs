use thiserror::Error;

use crate::types::RotationKey;

/// Errors that can occur during rotation operations.
#[derive(Debug, Error)]
pub enum RotationError {
    /// No rotation is stored under the key.
    #[error("rotation not found: {key}")]
    NotFound { key: RotationKey },

    /// A create-path write found a record already stored under the key.
    #[error("rotation already exists: {key}")]
    AlreadyExists { key: RotationKey },

    /// An update-path write found a different stored version.
    ///
    /// Recoverable: re-read the rotation and retry with its version.
    #[error("version conflict on {key}: expected version {expected}")]
    VersionConflict { key: RotationKey, expected: u64 },

    /// Malformed input; nothing was written.
    #[error("invalid rotation: {0}")]
    Validation(String),

    /// The caller cancelled the operation before the write was issued.
    #[error("rotation operation cancelled")]
    Cancelled,

    /// The underlying store failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl RotationError {
    /// True for both lost-race outcomes of a conditional write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RotationError::VersionConflict { .. } | RotationError::AlreadyExists { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            RotationError::NotFound { .. } => "NOT_FOUND",
            RotationError::AlreadyExists { .. } => "ALREADY_EXISTS",
            RotationError::VersionConflict { .. } => "VERSION_CONFLICT",
            RotationError::Validation(_) => "VALIDATION_ERROR",
            RotationError::Cancelled => "CANCELLED",
            RotationError::Database(_) => "STORE_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, RotationError>;
