use rulepay_core::audit::AuditStoreError;
use thiserror::Error;

pub mod audit_trail;

pub use audit_trail::SqlAuditTrailRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for AuditStoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => Self::Storage(error.to_string()),
            RepositoryError::Decode(message) => Self::Encoding(message),
        }
    }
}
