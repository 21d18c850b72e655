use nervusdb_api::IndexOrder;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file magic")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedFormatVersion(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("write lock held by another process: {path}")]
    LockHeld { path: PathBuf },

    #[error("wal record too large: {0}")]
    WalRecordTooLarge(u32),

    #[error("wal protocol error: {0}")]
    WalProtocol(&'static str),

    #[error("wal corrupted at offset {offset}")]
    WalCorrupt { offset: u64 },

    #[error("page crc mismatch: order {order}, page {page_id}")]
    PageCrcMismatch { order: IndexOrder, page_id: u64 },

    #[error("manifest corrupted: {0}")]
    ManifestCorrupt(String),

    #[error("storage corrupted: {0}")]
    StorageCorrupted(&'static str),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

/// Coarse classification of errors, stable across variant churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Conflict,
    Corruption,
    Callback,
    Internal,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::LockHeld { .. } => ErrorKind::Conflict,
            Error::InvalidMagic
            | Error::UnsupportedFormatVersion(_)
            | Error::WalRecordTooLarge(_)
            | Error::WalProtocol(_)
            | Error::WalCorrupt { .. }
            | Error::PageCrcMismatch { .. }
            | Error::ManifestCorrupt(_)
            | Error::StorageCorrupted(_) => ErrorKind::Corruption,
            Error::Callback(_) => ErrorKind::Callback,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}
