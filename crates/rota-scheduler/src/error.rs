use rota_rotations::RotationError;
use thiserror::Error;

/// Errors that can occur within the schedule index or a tick.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Rotation persistence failed in a way the tick cannot absorb.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// An event with this `(scheduled_hour, event_id)` is already indexed.
    #[error("Duplicate event {event_id} in bucket {scheduled_hour}")]
    DuplicateEvent {
        scheduled_hour: String,
        event_id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    /// The tick was cancelled before it finished; events already handled stay handled.
    #[error("Tick cancelled after {processed} events")]
    Cancelled { processed: usize },
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "STORE_UNAVAILABLE",
            SchedulerError::Rotation(e) => e.code(),
            SchedulerError::DuplicateEvent { .. } => "ALREADY_EXISTS",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::Cancelled { .. } => "CANCELLED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
