use thiserror::Error;

use crate::wal::WalError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists")]
    KeyExists,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("value is not an integer")]
    NotInteger,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,

    #[error("key contains invalid characters")]
    KeyInvalid,

    #[error("snapshot already in progress")]
    SnapshotInProgress,

    #[error("invalid snapshot file: {0}")]
    InvalidSnapshot(String),

    #[error("corrupted snapshot record")]
    CorruptedSnapshot,

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("WAL write failed: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
