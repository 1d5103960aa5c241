//! WAL file store: maps LSNs onto numbered segment files.

use std::sync::Arc;

use tracing::debug;

use crate::error::{AriesError, Result};
use crate::storage::page::{DbFile, DiskManager};
use crate::storage::wal::{
    LogSequenceNumber, MAX_WAL_FILE_NUMBER, OFFSET_FIRST_RECORD, OFFSET_PREV_FILE_END,
};
use crate::storage::{check_file_header, write_file_header, DbFileType};

/// Returns the file name of WAL segment `file_no`, e.g. `wal-00042.log`.
#[must_use]
pub fn wal_file_name(file_no: u16) -> String {
    format!("wal-{file_no:05}.log")
}

/// Returns the segment number following `file_no`, wrapping at the maximum.
#[must_use]
pub const fn next_file_no(file_no: u16) -> u16 {
    if file_no == MAX_WAL_FILE_NUMBER {
        0
    } else {
        file_no + 1
    }
}

/// Returns the segment number preceding `file_no`, wrapping at zero.
#[must_use]
pub const fn prev_file_no(file_no: u16) -> u16 {
    if file_no == 0 {
        MAX_WAL_FILE_NUMBER
    } else {
        file_no - 1
    }
}

/// Creates, opens and removes WAL segments in the database directory.
pub struct WalFileStore {
    disk_manager: Arc<DiskManager>,
    max_file_size: u32,
}

impl WalFileStore {
    /// Creates a store whose segments are capped at `max_file_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] if the cap leaves no room
    /// for records after the segment header.
    pub fn new(disk_manager: Arc<DiskManager>, max_file_size: u32) -> Result<Self> {
        if max_file_size <= OFFSET_FIRST_RECORD {
            return Err(AriesError::InvalidArgument(format!(
                "WAL segment size must exceed {OFFSET_FIRST_RECORD} bytes, got {max_file_size}"
            )));
        }
        Ok(Self {
            disk_manager,
            max_file_size,
        })
    }

    /// Returns the segment size cap.
    #[must_use]
    pub fn max_file_size(&self) -> u32 {
        self.max_file_size
    }

    /// Returns the LSN at which the next record starts once the current
    /// segment's data ends at `end_offset`.
    ///
    /// When the cap is reached the next record starts a new segment.
    #[must_use]
    pub fn compute_next_lsn(&self, file_no: u16, end_offset: u32) -> LogSequenceNumber {
        if end_offset >= self.max_file_size {
            LogSequenceNumber::new(next_file_no(file_no), OFFSET_FIRST_RECORD)
        } else {
            LogSequenceNumber::new(file_no, end_offset)
        }
    }

    /// Returns true if segment `file_no` exists.
    #[must_use]
    pub fn exists(&self, file_no: u16) -> bool {
        self.disk_manager.exists(&wal_file_name(file_no))
    }

    /// Opens an existing segment for reading. Never creates files.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::NotFound`] if the segment does not exist, or a
    /// storage error if it is not a WAL file.
    pub fn open_for_read(&self, file_no: u16) -> Result<Arc<DbFile>> {
        let file = self.disk_manager.open(&wal_file_name(file_no))?;
        check_file_header(&file, DbFileType::WriteAheadLog)?;
        Ok(file)
    }

    /// Creates (or truncates) segment `file_no` with a fresh header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create_segment(&self, file_no: u16, prev_file_end: u32) -> Result<Arc<DbFile>> {
        let file = self.disk_manager.create(&wal_file_name(file_no))?;
        write_file_header(&file, DbFileType::WriteAheadLog)?;
        file.write_at(u64::from(OFFSET_PREV_FILE_END), &prev_file_end.to_be_bytes())?;
        debug!(file_no, prev_file_end, "Created WAL segment");
        Ok(file)
    }

    /// Opens the segment holding `lsn` for appending at `lsn`.
    ///
    /// A missing segment is created when `lsn` is its first record
    /// position; its header then points at the end of the previous segment
    /// file if that one still exists. Bytes past `lsn` left by writes that
    /// never became durable are discarded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the segment is missing and `lsn` is not
    /// at its first record position.
    pub fn open_for_write(&self, lsn: LogSequenceNumber) -> Result<Arc<DbFile>> {
        let file_no = lsn.log_file_no();

        if !self.exists(file_no) {
            if lsn.file_offset() != OFFSET_FIRST_RECORD {
                return Err(AriesError::StorageError(format!(
                    "WAL segment {} is missing but the log continues at {lsn}",
                    wal_file_name(file_no)
                )));
            }
            let prev = prev_file_no(file_no);
            let prev_file_end = if self.exists(prev) {
                u32::try_from(self.open_for_read(prev)?.len()?).unwrap_or(u32::MAX)
            } else {
                0
            };
            return self.create_segment(file_no, prev_file_end);
        }

        let file = self.open_for_read(file_no)?;
        if file.len()? > u64::from(lsn.file_offset()) {
            file.set_len(u64::from(lsn.file_offset()))?;
        }
        Ok(file)
    }

    /// Reads the previous segment's end offset from a segment header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    pub fn read_prev_file_end(&self, file: &DbFile) -> Result<u32> {
        let mut buf = [0u8; 4];
        file.read_at(u64::from(OFFSET_PREV_FILE_END), &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Deletes every segment that lies wholly before segment `file_no`.
    ///
    /// Walks backward from `file_no - 1` until a segment is missing.
    /// Returns the number of segments removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn remove_segments_before(&self, file_no: u16) -> Result<usize> {
        let mut removed = 0;
        let mut candidate = prev_file_no(file_no);

        while candidate != file_no && self.exists(candidate) {
            self.disk_manager.remove(&wal_file_name(candidate))?;
            debug!(file_no = candidate, "Removed WAL segment");
            removed += 1;
            candidate = prev_file_no(candidate);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store(max_file_size: u32) -> (WalFileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path()).unwrap());
        (WalFileStore::new(dm, max_file_size).unwrap(), temp_dir)
    }

    #[test]
    fn test_file_names() {
        assert_eq!(wal_file_name(0), "wal-00000.log");
        assert_eq!(wal_file_name(65_535), "wal-65535.log");
    }

    #[test]
    fn test_file_numbers_wrap() {
        assert_eq!(next_file_no(MAX_WAL_FILE_NUMBER), 0);
        assert_eq!(prev_file_no(0), MAX_WAL_FILE_NUMBER);
        assert_eq!(next_file_no(4), 5);
    }

    #[test]
    fn test_cap_too_small() {
        let temp_dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path()).unwrap());
        assert!(matches!(
            WalFileStore::new(dm, 6),
            Err(AriesError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compute_next_lsn() {
        let (store, _temp) = create_test_store(100);
        assert_eq!(store.compute_next_lsn(3, 99), LogSequenceNumber::new(3, 99));
        assert_eq!(store.compute_next_lsn(3, 100), LogSequenceNumber::new(4, 6));
        assert_eq!(
            store.compute_next_lsn(MAX_WAL_FILE_NUMBER, 150),
            LogSequenceNumber::new(0, 6)
        );
    }

    #[test]
    fn test_open_for_read_missing() {
        let (store, _temp) = create_test_store(100);
        assert!(matches!(store.open_for_read(0), Err(AriesError::NotFound(_))));
    }

    #[test]
    fn test_segment_header() {
        let (store, _temp) = create_test_store(100);
        let file = store.create_segment(2, 1234).unwrap();
        assert_eq!(file.len().unwrap(), u64::from(OFFSET_FIRST_RECORD));
        assert_eq!(store.read_prev_file_end(&file).unwrap(), 1234);
        assert!(store.open_for_read(2).is_ok());
    }

    #[test]
    fn test_open_for_write_lazy_header() {
        let (store, _temp) = create_test_store(100);
        let first = store.open_for_write(LogSequenceNumber::new(0, 6)).unwrap();
        assert_eq!(store.read_prev_file_end(&first).unwrap(), 0);
        first.write_at(6, &[1; 20]).unwrap();

        let second = store.open_for_write(LogSequenceNumber::new(1, 6)).unwrap();
        assert_eq!(store.read_prev_file_end(&second).unwrap(), 26);
    }

    #[test]
    fn test_open_for_write_discards_tail() {
        let (store, _temp) = create_test_store(100);
        let file = store.create_segment(0, 0).unwrap();
        file.write_at(6, &[1; 30]).unwrap();

        let file = store.open_for_write(LogSequenceNumber::new(0, 16)).unwrap();
        assert_eq!(file.len().unwrap(), 16);
    }

    #[test]
    fn test_open_for_write_missing_mid_segment() {
        let (store, _temp) = create_test_store(100);
        assert!(store.open_for_write(LogSequenceNumber::new(0, 50)).is_err());
    }

    #[test]
    fn test_remove_segments_before() {
        let (store, _temp) = create_test_store(100);
        for no in 0..4 {
            store.create_segment(no, 0).unwrap();
        }

        assert_eq!(store.remove_segments_before(3).unwrap(), 3);
        assert!(!store.exists(0));
        assert!(!store.exists(2));
        assert!(store.exists(3));
        assert_eq!(store.remove_segments_before(3).unwrap(), 0);
    }
}
