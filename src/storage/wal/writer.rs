//! WAL writer for the serialized append path.

use std::sync::Arc;

use tracing::debug;

use crate::error::{AriesError, Result};
use crate::storage::page::DbFile;
use crate::storage::wal::{LogSequenceNumber, WalFileStore, WalRecord};

/// Appends records at the tail of the log.
///
/// Owns the global "next LSN" pointer. Callers serialize access (the
/// manager keeps the writer behind a mutex), so a record is completely
/// written before the next append starts.
pub struct WalWriter {
    store: Arc<WalFileStore>,
    /// Position where the next record will be written.
    next_lsn: LogSequenceNumber,
    /// Segment holding `next_lsn`, opened on first use.
    current: Option<(u16, Arc<DbFile>)>,
    /// Everything before this position is on stable storage.
    durable_lsn: LogSequenceNumber,
    /// Whether forcing issues an fsync.
    sync: bool,
}

impl WalWriter {
    /// Creates a writer that appends at `next_lsn`.
    ///
    /// Everything before `next_lsn` is assumed durable.
    #[must_use]
    pub fn new(store: Arc<WalFileStore>, next_lsn: LogSequenceNumber, sync: bool) -> Self {
        Self {
            store,
            next_lsn,
            current: None,
            durable_lsn: next_lsn,
            sync,
        }
    }

    /// Returns the position of the next record.
    #[must_use]
    pub fn next_lsn(&self) -> LogSequenceNumber {
        self.next_lsn
    }

    /// Returns the durable prefix of the log.
    #[must_use]
    pub fn durable_lsn(&self) -> LogSequenceNumber {
        self.durable_lsn
    }

    /// Repositions the writer at `next_lsn`, treating everything before it
    /// as durable. Used once, before recovery appends anything.
    pub fn reset(&mut self, next_lsn: LogSequenceNumber) {
        self.next_lsn = next_lsn;
        self.durable_lsn = next_lsn;
        self.current = None;
    }

    fn current_segment(&mut self) -> Result<Arc<DbFile>> {
        let file_no = self.next_lsn.log_file_no();
        if let Some((no, file)) = &self.current {
            if *no == file_no {
                return Ok(Arc::clone(file));
            }
        }

        let file = self.store.open_for_write(self.next_lsn)?;
        self.current = Some((file_no, Arc::clone(&file)));
        Ok(file)
    }

    /// Appends `record` and returns its LSN, annotated with its size.
    ///
    /// When the record fills the segment up to the cap, the segment is
    /// synced and the next one created with its header pointing back at
    /// this segment's end.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any write fails. The next LSN does
    /// not move on failure.
    pub fn append(&mut self, record: &WalRecord) -> Result<LogSequenceNumber> {
        let lsn = self.next_lsn;
        let file = self.current_segment()?;
        let bytes = record.encode(lsn.file_offset())?;

        let size = u32::try_from(bytes.len())
            .map_err(|_| AriesError::InvalidArgument("WAL record too large".into()))?;
        let end = lsn.file_offset().checked_add(size).ok_or_else(|| {
            AriesError::StorageError(format!("WAL segment {} overflows", lsn.log_file_no()))
        })?;

        file.write_at(u64::from(lsn.file_offset()), &bytes)?;

        let next = self.store.compute_next_lsn(lsn.log_file_no(), end);
        if next.log_file_no() != lsn.log_file_no() {
            if self.sync {
                file.sync()?;
            }
            let new_file = self.store.create_segment(next.log_file_no(), end)?;
            debug!(
                from = lsn.log_file_no(),
                to = next.log_file_no(),
                end,
                "WAL segment rollover"
            );
            self.current = Some((next.log_file_no(), new_file));
        }

        self.next_lsn = next;
        Ok(lsn.with_record_size(size))
    }

    /// Makes the log durable through `lsn` (exclusive).
    ///
    /// `lsn` is normalized onto a record boundary and clamped to the next
    /// LSN. Returns the new durable position, or `None` if it was already
    /// durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn force(&mut self, lsn: LogSequenceNumber) -> Result<Option<LogSequenceNumber>> {
        let target = self
            .store
            .compute_next_lsn(lsn.log_file_no(), lsn.file_offset())
            .min(self.next_lsn);
        if target <= self.durable_lsn {
            return Ok(None);
        }

        // Earlier segments were synced when the writer moved past them.
        if self.sync {
            if let Some((_, file)) = &self.current {
                file.sync()?;
            }
        }

        self.durable_lsn = target;
        debug!(%target, "Forced WAL");
        Ok(Some(target))
    }
}
