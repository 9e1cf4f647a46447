use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing session/connection is in a state where no further reads
    /// or writes can be trusted.
    #[error("persistence session unusable: {0}")]
    Unrecoverable(String),
    /// A prior unrecoverable failure already poisoned this session.
    #[error("persistence session poisoned by an earlier failure")]
    SessionPoisoned,
    #[error("row {0} not found")]
    NotFound(Uuid),
    #[error("column decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Structural failures that taint the whole session, as opposed to
    /// per-row conditions the caller can absorb.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Unrecoverable(_) | StoreError::SessionPoisoned | StoreError::Database(_)
        )
    }
}
