use thiserror::Error;

/// Storage layer error type.
///
/// Wraps the backend's own errors while preserving the error chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "postgres")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A payload could not be encoded or decoded.
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// The referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The backend does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The backend is unreachable or refused the call.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
