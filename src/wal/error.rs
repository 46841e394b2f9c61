use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid WAL magic")]
    InvalidMagic,

    #[error("unsupported WAL version: {0}")]
    InvalidVersion(u16),

    #[error("unknown record type: {0}")]
    UnknownRecordType(u8),

    #[error("corrupted WAL record")]
    CorruptedRecord,

    #[error("invalid WAL filename: {0}")]
    InvalidFileName(String),

    #[error("start WAL not found: {0}")]
    StartNotFound(String),
}
