use thiserror::Error;

use nfe_core::IdentityError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not complete the operation. Nothing from the failed
    /// call was committed; callers abort the current unit and retry later.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("company {0} is not monitored")]
    CompanyNotFound(String),
    #[error("document {0} not found")]
    DocumentNotFound(String),
    #[error("document {0} is no longer pending notification")]
    NotPending(String),
    /// Another worker claimed the document or company after this caller's lease lapsed.
    #[error("lease on {0} is held by another worker")]
    LeaseLost(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// The caller no longer owns the unit it was working on and must drop it.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::NotPending(_) | Self::LeaseLost(_))
    }
}

impl From<IdentityError> for StoreError {
    fn from(err: IdentityError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
