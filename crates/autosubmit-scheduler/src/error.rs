use thiserror::Error;

/// Errors that can occur within the scheduling subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error. Transient from the workers' point of
    /// view: the tick is abandoned and retried on the next one.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The submitted job failed validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given ID exists (or it belongs to another owner).
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A computed lease deadline or retry time left the storable range.
    #[error("Timestamp out of range: {0}")]
    TimeOutOfRange(String),

    /// A dispatch was attempted with a job that carries no claim.
    #[error("Job {id} is not claimed")]
    NotClaimed { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
