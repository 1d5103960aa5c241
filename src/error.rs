//! Error types for ariesdb storage and recovery operations.

use thiserror::Error;

use crate::storage::wal::LogSequenceNumber;

/// Result type alias using [`AriesError`].
pub type Result<T> = std::result::Result<T, AriesError>;

/// Error types for ariesdb storage and recovery operations.
#[derive(Debug, Error)]
pub enum AriesError {
    /// Malformed argument supplied by the caller (bad LSN parts, missing
    /// `prevLSN` on a commit/abort record, oversized file name, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in a state that does not allow it (no
    /// transaction in progress, page not dirty, ...).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // ==================== Write-Ahead Log Errors ====================
    /// The write-ahead log contents are inconsistent. Always fatal to the
    /// enclosing recovery or rollback.
    #[error("Corrupt write-ahead log at {lsn}: {message}")]
    CorruptLog {
        lsn: LogSequenceNumber,
        message: String,
    },

    /// A file that must already exist is missing.
    #[error("File not found: {0}")]
    NotFound(String),

    // ==================== Storage Errors ====================
    /// General storage error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Page-related errors.
    #[error("Page error: {0}")]
    PageError(String),

    /// Buffer pool errors.
    #[error("Buffer pool error: {0}")]
    BufferPoolError(String),

    /// Checksum validation failure.
    #[error("Checksum mismatch: {0}")]
    ChecksumError(String),

    /// Invalid transaction-state or typed file.
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// Unsupported transaction-state file version.
    #[error("Unsupported database version: {version} (max supported: {max_supported})")]
    UnsupportedVersion { version: u32, max_supported: u32 },

    /// Underlying I/O failure, propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AriesError {
    /// Builds a [`AriesError::CorruptLog`] for the given LSN.
    pub fn corrupt(lsn: LogSequenceNumber, message: impl Into<String>) -> Self {
        AriesError::CorruptLog {
            lsn,
            message: message.into(),
        }
    }

    /// Returns true if this error means the log itself is unusable.
    #[must_use]
    pub fn is_corrupt_log(&self) -> bool {
        matches!(self, AriesError::CorruptLog { .. })
    }
}
