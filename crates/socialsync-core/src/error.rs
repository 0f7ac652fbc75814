//! Error types for SocialSync

use thiserror::Error;

/// Main error type for SocialSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The content-addressed store or its network handle could not be created or used
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A requested CID or entity resolves nowhere
    #[error("Not found: {0}")]
    NotFound(String),

    /// The peer-replication network is unreachable
    #[error("Replication unavailable: {0}")]
    ReplicationUnavailable(String),

    /// A push or pull against the remote cache service failed
    #[error("Remote cache unreachable: {0}")]
    RemoteCacheUnreachable(String),

    /// Stored bytes could not be decompressed
    #[error("Decompression failed: {0}")]
    DecompressionFailure(String),

    /// Error during storage operations (redb)
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

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether the error came from a network or peer layer that may recover on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_)
                | SyncError::ReplicationUnavailable(_)
                | SyncError::RemoteCacheUnreachable(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
