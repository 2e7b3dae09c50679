//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::{PageId, RowId};
use crate::storage::wal::record::Lsn;

/// Errors that can occur in the storage layer.
///
/// `Io` and `Corruption` are fatal: once either is observed the engine
/// latches into a halted state and stops accepting new transactions.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Record too large: {size} bytes (max: {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Row id {0} lies beyond the addressable page range")]
    RowIdOutOfRange(RowId),

    #[error("Buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("WAL is halted after a previous failure (last durable LSN: {flushed})")]
    WalHalted { flushed: Lsn },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether this error must halt the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::Corruption(_) | StorageError::WalHalted { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
