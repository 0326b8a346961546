use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The whole batch was rejected at admission; nothing was persisted.
    #[error("Batch rejected: {0}")]
    BatchValidation(String),

    /// Another session won the claim. The caller should simply move on.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The lease was reclaimed before the attempt could commit.
    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// True when the error only means "someone else got there first".
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
