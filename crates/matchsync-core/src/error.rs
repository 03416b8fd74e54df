//! Error types for the match sync layer

use std::time::Duration;

use thiserror::Error;

/// Main error type for match sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network unreachable, connection reset, backend temporarily unavailable
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Backend rejected the operation for this user
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Referenced record no longer exists remotely
    #[error("Not found: {0}")]
    NotFound(String),

    /// A remote record could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A create precondition failed because the document already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A connectivity-dependent wait ran out of time
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What we were waiting for
        what: String,
        /// How long we waited
        waited: Duration,
    },

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error during local storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`SyncError`].
///
/// `SyncError` is not `Clone` (it wraps redb and io errors), so events that
/// fan out over broadcast channels carry this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    Permission,
    NotFound,
    Serialization,
    AlreadyExists,
    Timeout,
    InvalidOperation,
    Config,
    Storage,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SyncError::Permission(_) => ErrorKind::Permission,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Storage(_)
            | SyncError::Database(_)
            | SyncError::Transaction(_)
            | SyncError::Table(_)
            | SyncError::StorageOp(_)
            | SyncError::Commit(_)
            | SyncError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Whether the operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientNetwork | ErrorKind::Timeout)
    }

    /// Benign errors are reconciled silently (e.g. a match vanished remotely).
    pub fn is_benign(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        SyncError::Timeout {
            what: what.into(),
            waited,
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NotFound("matches/m1".to_string());
        assert_eq!(format!("{}", err), "Not found: matches/m1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
        assert_eq!(sync_err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::TransientNetwork("offline".into()).is_retryable());
        assert!(SyncError::timeout("connection", Duration::from_secs(1)).is_retryable());
        assert!(!SyncError::Permission("denied".into()).is_retryable());
        assert!(!SyncError::Serialization("bad".into()).is_retryable());
        assert!(SyncError::NotFound("gone".into()).is_benign());
        assert!(!SyncError::Permission("denied".into()).is_benign());
    }
}
