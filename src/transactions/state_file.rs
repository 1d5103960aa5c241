//! Persistent transaction state (`txnstate.dat`).
//!
//! # Layout
//!
//! ```text
//! [type 20][log2 page size][payload len u32 BE][bincode payload][crc32 u32 BE]
//! ```
//!
//! The payload carries the recovery range and the next transaction ID.
//! The whole file is rewritten and synced on every update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AriesError, Result};
use crate::storage::page::{DbFile, DiskManager};
use crate::storage::wal::{Lsn, OFFSET_FIRST_RECORD};
use crate::storage::{check_file_header, write_file_header, DbFileType, FILE_HEADER_SIZE};

/// Name of the transaction-state file in the database directory.
pub const TXNSTATE_FILENAME: &str = "txnstate.dat";

/// Magic bytes identifying the payload.
pub const TXNSTATE_MAGIC: &[u8; 8] = b"ARIESTXN";

/// Current payload format version.
pub const TXNSTATE_VERSION: u32 = 1;

/// Contents of the transaction-state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnState {
    /// Magic bytes for file identification.
    pub magic: [u8; 8],
    /// Payload format version.
    pub version: u32,
    /// Database UUID, fixed at creation.
    pub database_id: Uuid,
    /// Next transaction ID to hand out.
    pub next_txn_id: u32,
    /// Oldest record recovery must replay.
    pub first_lsn: Lsn,
    /// End (exclusive) of the durable log.
    pub next_lsn: Lsn,
}

impl TxnState {
    /// Creates the state of a brand-new database.
    #[must_use]
    pub fn new(database_id: Uuid) -> Self {
        let start = Lsn::new(0, OFFSET_FIRST_RECORD);
        Self {
            magic: *TXNSTATE_MAGIC,
            version: TXNSTATE_VERSION,
            database_id,
            next_txn_id: 1,
            first_lsn: start,
            next_lsn: start,
        }
    }

    /// Validates the magic bytes and version.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is not from a supported format.
    pub fn validate(&self) -> Result<()> {
        if self.magic != *TXNSTATE_MAGIC {
            return Err(AriesError::InvalidDatabaseFile(
                "Invalid transaction-state magic bytes".into(),
            ));
        }
        if self.version > TXNSTATE_VERSION {
            return Err(AriesError::UnsupportedVersion {
                version: self.version,
                max_supported: TXNSTATE_VERSION,
            });
        }
        if self.first_lsn > self.next_lsn {
            return Err(AriesError::InvalidDatabaseFile(format!(
                "Recovery range {} .. {} is inverted",
                self.first_lsn, self.next_lsn
            )));
        }
        Ok(())
    }
}

/// Handle to the transaction-state file plus its last written contents.
pub struct TxnStateFile {
    file: Arc<DbFile>,
    state: TxnState,
}

impl TxnStateFile {
    /// Loads the state file, creating it for a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is unreadable, has a bad
    /// checksum, or has an unsupported format.
    pub fn open_or_create(disk_manager: &DiskManager) -> Result<Self> {
        if disk_manager.exists(TXNSTATE_FILENAME) {
            let file = disk_manager.open(TXNSTATE_FILENAME)?;
            check_file_header(&file, DbFileType::TxnState)?;
            let state = Self::decode(&file.read_all()?)?;
            return Ok(Self { file, state });
        }

        let file = disk_manager.create(TXNSTATE_FILENAME)?;
        let mut state_file = Self {
            file,
            state: TxnState::new(Uuid::new_v4()),
        };
        state_file.write(state_file.state.clone())?;
        Ok(state_file)
    }

    /// Returns the last written state.
    #[must_use]
    pub fn state(&self) -> &TxnState {
        &self.state
    }

    /// Replaces the stored state and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any write fails.
    pub fn write(&mut self, state: TxnState) -> Result<()> {
        let payload = bincode::serialize(&state).map_err(|e| {
            AriesError::StorageError(format!("Failed to serialize transaction state: {e}"))
        })?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| AriesError::StorageError("Transaction state too large".into()))?;

        let mut body = Vec::with_capacity(payload.len() + 8);
        body.extend_from_slice(&payload_len.to_be_bytes());
        body.extend_from_slice(&payload);
        body.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());

        write_file_header(&self.file, DbFileType::TxnState)?;
        self.file.write_at(FILE_HEADER_SIZE as u64, &body)?;
        self.file.set_len((FILE_HEADER_SIZE + body.len()) as u64)?;
        self.file.sync()?;

        self.state = state;
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<TxnState> {
        let read_u32 = |pos: usize| -> Result<u32> {
            data.get(pos..pos + 4)
                .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| {
                    AriesError::InvalidDatabaseFile("Transaction-state file is truncated".into())
                })
        };

        let payload_start = FILE_HEADER_SIZE + 4;
        let payload_len = read_u32(FILE_HEADER_SIZE)? as usize;
        let payload_end = payload_start + payload_len;
        let expected = read_u32(payload_end)?;
        let payload = &data[payload_start..payload_end];

        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(AriesError::ChecksumError(format!(
                "Transaction state checksum mismatch: expected {expected:#x}, got {actual:#x}"
            )));
        }

        let state: TxnState = bincode::deserialize(payload).map_err(|e| {
            AriesError::InvalidDatabaseFile(format!("Failed to parse transaction state: {e}"))
        })?;
        state.validate()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let file = TxnStateFile::open_or_create(&dm).unwrap();

        let state = file.state();
        assert_eq!(state.next_txn_id, 1);
        assert_eq!(state.first_lsn, Lsn::new(0, 6));
        assert_eq!(state.next_lsn, Lsn::new(0, 6));
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let database_id;

        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            let mut file = TxnStateFile::open_or_create(&dm).unwrap();
            database_id = file.state().database_id;

            let mut state = file.state().clone();
            state.next_txn_id = 42;
            state.first_lsn = Lsn::new(1, 6);
            state.next_lsn = Lsn::new(1, 500);
            file.write(state).unwrap();
        }

        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            let file = TxnStateFile::open_or_create(&dm).unwrap();
            let state = file.state();
            assert_eq!(state.database_id, database_id);
            assert_eq!(state.next_txn_id, 42);
            assert_eq!(state.first_lsn, Lsn::new(1, 6));
            assert_eq!(state.next_lsn, Lsn::new(1, 500));
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            TxnStateFile::open_or_create(&dm).unwrap();
        }

        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let file = dm.open(TXNSTATE_FILENAME).unwrap();
        let mut byte = [0u8; 1];
        file.read_at(8, &mut byte).unwrap();
        file.write_at(8, &[byte[0] ^ 0xFF]).unwrap();

        assert!(matches!(
            TxnStateFile::open_or_create(&dm),
            Err(AriesError::ChecksumError(_))
        ));
    }

    #[test]
    fn test_wrong_file_type() {
        let temp_dir = TempDir::new().unwrap();
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let file = dm.create(TXNSTATE_FILENAME).unwrap();
        write_file_header(&file, DbFileType::WriteAheadLog).unwrap();

        assert!(matches!(
            TxnStateFile::open_or_create(&dm),
            Err(AriesError::StorageError(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut state = TxnState::new(Uuid::new_v4());
        assert!(state.validate().is_ok());

        state.version = TXNSTATE_VERSION + 1;
        assert!(matches!(
            state.validate(),
            Err(AriesError::UnsupportedVersion { .. })
        ));

        state.version = TXNSTATE_VERSION;
        state.magic = *b"NOTMAGIC";
        assert!(matches!(
            state.validate(),
            Err(AriesError::InvalidDatabaseFile(_))
        ));
    }
}
