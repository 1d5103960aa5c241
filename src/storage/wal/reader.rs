//! WAL reader for forward and backward traversal.

use std::sync::Arc;

use crate::error::{AriesError, Result};
use crate::storage::wal::{
    decode_record, prev_file_no, record_start_before, LogSequenceNumber, WalFileStore, WalRecord,
    OFFSET_FIRST_RECORD,
};

/// Reads records out of WAL segments.
///
/// Segments are loaded whole and the most recent one is cached, so a
/// reader must not outlive the data it is asked about: records appended
/// after a segment was loaded are invisible to it. Create a fresh reader
/// per scan.
pub struct WalReader {
    store: Arc<WalFileStore>,
    cached: Option<(u16, Arc<Vec<u8>>)>,
}

impl WalReader {
    /// Creates a reader over the segments in `store`.
    #[must_use]
    pub fn new(store: Arc<WalFileStore>) -> Self {
        Self {
            store,
            cached: None,
        }
    }

    fn segment(&mut self, file_no: u16) -> Result<Arc<Vec<u8>>> {
        if let Some((no, data)) = &self.cached {
            if *no == file_no {
                return Ok(Arc::clone(data));
            }
        }

        let data = Arc::new(self.store.open_for_read(file_no)?.read_all()?);
        self.cached = Some((file_no, Arc::clone(&data)));
        Ok(data)
    }

    /// Decodes the record at `lsn`.
    ///
    /// Returns the record, its LSN annotated with the record size, and the
    /// LSN where the following record starts.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::NotFound`] if the segment is missing, or
    /// [`AriesError::CorruptLog`] if the record cannot be decoded.
    pub fn read_record(
        &mut self,
        lsn: LogSequenceNumber,
    ) -> Result<(WalRecord, LogSequenceNumber, LogSequenceNumber)> {
        let data = self.segment(lsn.log_file_no())?;
        let (record, end) = decode_record(&data, lsn)?;

        // Segments never exceed u32 offsets.
        let end = end as u32;
        let size = end - lsn.file_offset();
        let next = self.store.compute_next_lsn(lsn.log_file_no(), end);
        Ok((record, lsn.with_record_size(size), next))
    }

    /// Locates the record that ends at `end`, stepping into earlier
    /// segments through their headers as needed.
    ///
    /// Returns `None` once `end` is at or below `lower_bound`, or when a
    /// segment header says no earlier log data exists.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if `end` is not a record
    /// boundary.
    pub fn step_back(
        &mut self,
        mut end: LogSequenceNumber,
        lower_bound: LogSequenceNumber,
    ) -> Result<Option<LogSequenceNumber>> {
        loop {
            if end <= lower_bound {
                return Ok(None);
            }

            let file_no = end.log_file_no();
            let offset = end.file_offset();

            if offset < OFFSET_FIRST_RECORD {
                return Err(AriesError::corrupt(
                    end,
                    "position lies inside the segment header",
                ));
            }

            if offset == OFFSET_FIRST_RECORD {
                let file = self.store.open_for_read(file_no)?;
                let prev_end = self.store.read_prev_file_end(&file)?;
                if prev_end == 0 {
                    return Ok(None);
                }
                end = LogSequenceNumber::new(prev_file_no(file_no), prev_end);
                continue;
            }

            let data = self.segment(file_no)?;
            let start = record_start_before(&data, offset as usize, end)?;
            // start < offset, so it fits.
            let start = start as u32;
            return Ok(Some(
                LogSequenceNumber::new(file_no, start).with_record_size(offset - start),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DiskManager;
    use crate::storage::wal::WalWriter;
    use tempfile::TempDir;

    fn write_records(max_file_size: u32, count: u32) -> (Arc<WalFileStore>, Vec<LogSequenceNumber>, LogSequenceNumber, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path()).unwrap());
        let store = Arc::new(WalFileStore::new(dm, max_file_size).unwrap());
        let mut writer = WalWriter::new(Arc::clone(&store), LogSequenceNumber::new(0, 6), false);

        let mut lsns = Vec::new();
        for txn_id in 0..count {
            let record = if txn_id % 2 == 0 {
                WalRecord::StartTxn { txn_id }
            } else {
                WalRecord::AbortTxn {
                    txn_id,
                    prev_lsn: LogSequenceNumber::new(0, 6),
                }
            };
            lsns.push(writer.append(&record).unwrap());
        }
        let next = writer.next_lsn();
        (store, lsns, next, temp_dir)
    }

    #[test]
    fn test_forward_scan() {
        let (store, lsns, next, _temp) = write_records(1024, 6);
        let mut reader = WalReader::new(store);

        let mut lsn = LogSequenceNumber::new(0, 6);
        let mut seen = Vec::new();
        while lsn < next {
            let (record, at, following) = reader.read_record(lsn).unwrap();
            assert_eq!(record.txn_id() as usize, seen.len());
            seen.push(at);
            lsn = following;
        }
        assert_eq!(lsn, next);
        assert_eq!(seen, lsns);
    }

    #[test]
    fn test_backward_scan_across_segments() {
        // Start (6) + Abort (12) = 18 bytes per pair; cap splits the log.
        let (store, lsns, next, _temp) = write_records(30, 8);
        assert!(next.log_file_no() > 0);
        let mut reader = WalReader::new(store);

        let mut end = next;
        let mut seen = Vec::new();
        while let Some(lsn) = reader.step_back(end, LogSequenceNumber::new(0, 6)).unwrap() {
            seen.push(lsn);
            end = lsn;
        }
        seen.reverse();
        assert_eq!(seen, lsns);
    }

    #[test]
    fn test_backward_scan_stops_at_lower_bound() {
        let (store, lsns, next, _temp) = write_records(1024, 4);
        let mut reader = WalReader::new(store);

        let mut end = next;
        let mut count = 0;
        while let Some(lsn) = reader.step_back(end, lsns[2]).unwrap() {
            count += 1;
            end = lsn;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_step_back_inside_header() {
        let (store, _lsns, _next, _temp) = write_records(1024, 1);
        let mut reader = WalReader::new(store);
        let err = reader
            .step_back(LogSequenceNumber::new(0, 3), LogSequenceNumber::new(0, 0))
            .unwrap_err();
        assert!(err.is_corrupt_log());
    }
}
