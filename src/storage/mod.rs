//! Storage module for page-structured files and crash recovery.
//!
//! This module provides the storage layer for ariesdb, including:
//! - Page-level I/O over named files ([`page`])
//! - Buffer pool management with before/after page images ([`buffer_pool`])
//! - Write-ahead logging and ARIES-style recovery ([`wal`])

pub mod buffer_pool;
pub mod page;
pub mod wal;

// Re-export commonly used types
pub use buffer_pool::{BufferPool, BufferPoolObserver, BufferPoolStats, PageHandle};
pub use page::{DbFile, DiskManager, Page, PageId, PAGE_SIZE, PAGE_SIZE_LOG2};
pub use wal::{
    LogSequenceNumber, Lsn, RecoveryInfo, WalManager, WalRecord, WalRecordType,
};

use crate::error::{AriesError, Result};

/// Size of the generic header at the start of every typed file.
///
/// Layout:
/// - Offset 0: file type id (u8)
/// - Offset 1: log2 of the page size (u8)
pub const FILE_HEADER_SIZE: usize = 2;

/// Kinds of typed files managed by the storage layer.
///
/// Stored as the very first byte of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbFileType {
    /// Transaction-state file holding the recovery range.
    TxnState = 20,
    /// Write-ahead log segment.
    WriteAheadLog = 21,
}

impl TryFrom<u8> for DbFileType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            20 => Ok(DbFileType::TxnState),
            21 => Ok(DbFileType::WriteAheadLog),
            _ => Err(()),
        }
    }
}

/// Writes the typed-file header at offset 0.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_file_header(file: &DbFile, file_type: DbFileType) -> Result<()> {
    file.write_at(0, &[file_type as u8, PAGE_SIZE_LOG2])
}

/// Verifies that `file` starts with a header of the expected type.
///
/// # Errors
///
/// Returns [`AriesError::StorageError`] if the header is missing or names
/// a different file type or page size.
pub fn check_file_header(file: &DbFile, expected: DbFileType) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_SIZE];
    if file.read_at(0, &mut header)? < FILE_HEADER_SIZE {
        return Err(AriesError::StorageError(format!(
            "File {} is too short to hold a file header",
            file.name()
        )));
    }

    match DbFileType::try_from(header[0]) {
        Ok(actual) if actual == expected => {}
        _ => {
            return Err(AriesError::StorageError(format!(
                "File {} is not of type {expected:?} (type byte {})",
                file.name(),
                header[0]
            )));
        }
    }

    if header[1] != PAGE_SIZE_LOG2 {
        return Err(AriesError::StorageError(format!(
            "File {} uses page size 2^{}, expected 2^{PAGE_SIZE_LOG2}",
            file.name(),
            header[1]
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_type_conversion() {
        assert_eq!(DbFileType::try_from(20), Ok(DbFileType::TxnState));
        assert_eq!(DbFileType::try_from(21), Ok(DbFileType::WriteAheadLog));
        assert!(DbFileType::try_from(1).is_err());
    }

    #[test]
    fn test_file_header_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let file = dm.create("wal-00000.log").unwrap();

        write_file_header(&file, DbFileType::WriteAheadLog).unwrap();
        assert!(check_file_header(&file, DbFileType::WriteAheadLog).is_ok());
        assert!(check_file_header(&file, DbFileType::TxnState).is_err());
    }

    #[test]
    fn test_missing_header() {
        let temp_dir = TempDir::new().unwrap();
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let file = dm.create("empty.dat").unwrap();

        assert!(matches!(
            check_file_header(&file, DbFileType::TxnState),
            Err(AriesError::StorageError(_))
        ));
    }
}
