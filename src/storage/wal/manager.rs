//! WAL manager: append path, live rollback and recovery entry point.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{AriesError, Result};
use crate::storage::buffer_pool::{BufferPool, PageHandle};
use crate::storage::page::PageId;
use crate::storage::wal::{
    compute_segments, Checkpointer, LogSequenceNumber, RecoveryEngine, RecoveryInfo,
    RedoSegment, UpdateSegment, WalFileStore, WalReader, WalRecord, WalRecordType, WalWriter,
    MAX_FILE_NAME_LEN, OFFSET_FIRST_RECORD,
};
use crate::transactions::TransactionContext;

/// Owns the log and every operation that writes to it.
///
/// Appends are serialized on a single mutex around the writer; readers
/// load segments independently.
pub struct WalManager {
    store: Arc<WalFileStore>,
    buffer_pool: Arc<BufferPool>,
    writer: Mutex<WalWriter>,
    /// Oldest position recovery must replay from.
    first_lsn: Mutex<LogSequenceNumber>,
    checkpointer: Checkpointer,
}

impl WalManager {
    /// Creates a manager over an empty log positioned at the first record
    /// of segment 0. Recovery repositions it.
    #[must_use]
    pub fn new(buffer_pool: Arc<BufferPool>, store: Arc<WalFileStore>, sync: bool) -> Self {
        let start = LogSequenceNumber::new(0, OFFSET_FIRST_RECORD);
        Self {
            writer: Mutex::new(WalWriter::new(Arc::clone(&store), start, sync)),
            store,
            buffer_pool,
            first_lsn: Mutex::new(start),
            checkpointer: Checkpointer::new(),
        }
    }

    /// Returns the segment store.
    #[must_use]
    pub fn store(&self) -> &Arc<WalFileStore> {
        &self.store
    }

    /// Returns the buffer pool the log protects.
    #[must_use]
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Returns the checkpointer.
    #[must_use]
    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Returns the oldest position recovery must replay from.
    #[must_use]
    pub fn first_lsn(&self) -> LogSequenceNumber {
        *self.first_lsn.lock()
    }

    pub(crate) fn set_first_lsn(&self, lsn: LogSequenceNumber) {
        *self.first_lsn.lock() = lsn;
    }

    /// Returns the position of the next record.
    #[must_use]
    pub fn next_lsn(&self) -> LogSequenceNumber {
        self.writer.lock().next_lsn()
    }

    /// Returns the durable prefix of the log.
    #[must_use]
    pub fn durable_lsn(&self) -> LogSequenceNumber {
        self.writer.lock().durable_lsn()
    }

    /// Returns a fresh reader over the log.
    #[must_use]
    pub fn reader(&self) -> WalReader {
        WalReader::new(Arc::clone(&self.store))
    }

    /// Appends a fully built record.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn append(&self, record: &WalRecord) -> Result<LogSequenceNumber> {
        let lsn = self.writer.lock().append(record)?;
        debug!(%lsn, %record, "Appended WAL record");
        Ok(lsn)
    }

    /// Makes the log durable through `lsn` (exclusive).
    ///
    /// Returns the new durable position, or `None` if nothing needed syncing.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn force(&self, lsn: LogSequenceNumber) -> Result<Option<LogSequenceNumber>> {
        self.writer.lock().force(lsn)
    }

    /// Writes a `StartTxn`, `CommitTxn` or `AbortTxn` record for the
    /// context's transaction and advances its `last_lsn`.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if no transaction is in
    /// progress, or [`AriesError::InvalidArgument`] for a commit/abort with
    /// nothing logged before it.
    pub fn write_txn_record(
        &self,
        ctx: &mut TransactionContext,
        kind: WalRecordType,
    ) -> Result<LogSequenceNumber> {
        let txn_id = ctx.transaction_id.ok_or_else(|| {
            AriesError::IllegalState(format!("Cannot write {kind}: no transaction in progress"))
        })?;

        let lsn = self.write_txn_record_for(kind, txn_id, ctx.last_lsn)?;
        ctx.last_lsn = Some(lsn);
        if kind == WalRecordType::StartTxn {
            ctx.logged_start = true;
        }
        Ok(lsn)
    }

    /// Writes a transaction boundary record for an explicit transaction.
    ///
    /// `prev_lsn` is ignored for `StartTxn` and required otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] for a missing `prev_lsn` or a
    /// non-boundary record type.
    pub fn write_txn_record_for(
        &self,
        kind: WalRecordType,
        txn_id: u32,
        prev_lsn: Option<LogSequenceNumber>,
    ) -> Result<LogSequenceNumber> {
        let require_prev = || {
            prev_lsn.ok_or_else(|| {
                AriesError::InvalidArgument(format!(
                    "{kind} record for transaction {txn_id} requires a prevLSN"
                ))
            })
        };

        let record = match kind {
            WalRecordType::StartTxn => WalRecord::StartTxn { txn_id },
            WalRecordType::CommitTxn => WalRecord::CommitTxn {
                txn_id,
                prev_lsn: require_prev()?,
            },
            WalRecordType::AbortTxn => WalRecord::AbortTxn {
                txn_id,
                prev_lsn: require_prev()?,
            },
            WalRecordType::UpdatePage | WalRecordType::UpdatePageRedoOnly => {
                return Err(AriesError::InvalidArgument(format!(
                    "{kind} is not a transaction boundary record"
                )));
            }
        };
        self.append(&record)
    }

    /// Logs the changes made to `page` since its last logged change.
    ///
    /// The record holds the diff between the page's old and current
    /// images. Afterwards the page carries the record's LSN and its old
    /// image matches the current one.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if the page is not dirty, no
    /// transaction is in progress, or the transaction has no start record;
    /// [`AriesError::InvalidArgument`] if the page number cannot be logged.
    pub fn write_update_page_record(
        &self,
        ctx: &mut TransactionContext,
        page: &PageHandle<'_>,
    ) -> Result<LogSequenceNumber> {
        if !page.is_dirty() {
            return Err(AriesError::IllegalState(format!(
                "Cannot log an update to {}: page is not dirty",
                page.page_id()
            )));
        }
        let txn_id = ctx.transaction_id.ok_or_else(|| {
            AriesError::IllegalState("Cannot log a page update: no transaction in progress".into())
        })?;
        let prev_lsn = ctx.last_lsn.ok_or_else(|| {
            AriesError::IllegalState(format!(
                "Transaction {txn_id} has not logged a start record"
            ))
        })?;
        let page_no = check_loggable(page.page_id())?;

        let segments = page.with_images(|old, new| {
            compute_segments(old, new).map(|windows| {
                windows
                    .into_iter()
                    .map(|(offset, len)| UpdateSegment {
                        // Offsets are below PAGE_SIZE.
                        offset: offset as u16,
                        old_data: old[offset..offset + len].to_vec(),
                        new_data: new[offset..offset + len].to_vec(),
                    })
                    .collect::<Vec<_>>()
            })
        })?;

        let record = WalRecord::UpdatePage {
            txn_id,
            prev_lsn,
            file_name: page.page_id().file_name.to_string(),
            page_no,
            segments,
        };
        let lsn = self.append(&record)?;

        page.mark_logged(lsn);
        ctx.last_lsn = Some(lsn);
        Ok(lsn)
    }

    /// Logs already-applied bytes of `page` as a redo-only record.
    ///
    /// The page need not be dirty; the caller supplies the segments. Undo
    /// treats every redo-only record in a transaction's chain as the
    /// compensation of its newest not yet compensated update.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] if the page number cannot be
    /// logged or a segment leaves the page.
    pub fn write_redo_only_update_page_record(
        &self,
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
        page: &PageHandle<'_>,
        segments: Vec<RedoSegment>,
    ) -> Result<LogSequenceNumber> {
        let record = WalRecord::UpdatePageRedoOnly {
            txn_id,
            prev_lsn,
            file_name: page.page_id().file_name.to_string(),
            page_no: check_loggable(page.page_id())?,
            segments,
        };
        let lsn = self.append(&record)?;

        page.mark_logged(lsn);
        Ok(lsn)
    }

    /// Writes the new bytes of a logged change onto a page.
    pub(crate) fn redo_page<'s>(
        &self,
        page_id: &PageId,
        lsn: LogSequenceNumber,
        segments: impl Iterator<Item = (u16, &'s [u8])>,
    ) -> Result<()> {
        let mut page = self.buffer_pool.pin(page_id)?;
        for (offset, data) in segments {
            page.write(usize::from(offset), data)?;
        }
        page.mark_logged(lsn);
        Ok(())
    }

    /// Restores the old bytes of a logged change and writes the matching
    /// compensation record. Returns the compensation record's LSN.
    pub(crate) fn undo_update(
        &self,
        txn_id: u32,
        prev_lsn: LogSequenceNumber,
        page_id: &PageId,
        segments: &[UpdateSegment],
    ) -> Result<LogSequenceNumber> {
        let mut page = self.buffer_pool.pin(page_id)?;
        let mut redo = Vec::with_capacity(segments.len());
        for segment in segments {
            page.write(usize::from(segment.offset), &segment.old_data)?;
            redo.push(RedoSegment {
                offset: segment.offset,
                data: segment.old_data.clone(),
            });
        }
        self.write_redo_only_update_page_record(txn_id, prev_lsn, &page, redo)
    }

    /// Rolls back the context's transaction by walking its own record
    /// chain backward, undoing each page change, then writes `AbortTxn`.
    ///
    /// A no-op when no transaction is in progress or nothing was logged.
    /// Clears the context's `last_lsn` on success.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::CorruptLog`] if the chain contains a record of
    /// another transaction, an end record, or a forward link.
    pub fn rollback_transaction(&self, ctx: &mut TransactionContext) -> Result<()> {
        let Some(txn_id) = ctx.transaction_id else {
            return Ok(());
        };
        let Some(mut chain_tip) = ctx.last_lsn else {
            return Ok(());
        };

        info!(txn_id, "Rolling back transaction");
        let mut reader = self.reader();
        let mut lsn = chain_tip;
        let mut undone = 0;
        // Compensations left by an earlier, interrupted rollback.
        let mut compensated = 0usize;

        loop {
            let (record, at, _) = reader.read_record(lsn)?;
            if record.txn_id() != txn_id {
                return Err(AriesError::corrupt(
                    at,
                    format!(
                        "expected a record of transaction {txn_id}, found transaction {}",
                        record.txn_id()
                    ),
                ));
            }

            let prev_lsn = match record {
                WalRecord::StartTxn { .. } => break,
                WalRecord::UpdatePage {
                    prev_lsn,
                    file_name,
                    page_no,
                    segments,
                    ..
                } => {
                    if compensated > 0 {
                        compensated -= 1;
                    } else {
                        let page_id = PageId::new(file_name, u32::from(page_no));
                        chain_tip = self.undo_update(txn_id, chain_tip, &page_id, &segments)?;
                        ctx.last_lsn = Some(chain_tip);
                        undone += 1;
                    }
                    prev_lsn
                }
                WalRecord::UpdatePageRedoOnly { prev_lsn, .. } => {
                    compensated += 1;
                    prev_lsn
                }
                WalRecord::CommitTxn { .. } | WalRecord::AbortTxn { .. } => {
                    return Err(AriesError::corrupt(
                        at,
                        format!("transaction {txn_id} has already ended"),
                    ));
                }
            };

            if prev_lsn >= at {
                return Err(AriesError::corrupt(
                    at,
                    format!("prevLSN {prev_lsn} does not precede the record"),
                ));
            }
            lsn = prev_lsn;
        }

        self.write_txn_record_for(WalRecordType::AbortTxn, txn_id, Some(chain_tip))?;
        ctx.last_lsn = None;
        info!(txn_id, undone, "Rolled back transaction");
        Ok(())
    }

    /// Recovers `[first_lsn, next_lsn)` and truncates the log.
    ///
    /// Repositions the writer at `next_lsn` first, so this must run before
    /// any other append. `persist` receives the new `(first_lsn, next_lsn)`
    /// pair before obsolete segments are deleted.
    ///
    /// # Errors
    ///
    /// Any error aborts recovery; see [`RecoveryEngine::run`].
    pub fn do_recovery(
        &self,
        first_lsn: LogSequenceNumber,
        next_lsn: LogSequenceNumber,
        persist: impl FnOnce(LogSequenceNumber, LogSequenceNumber) -> Result<()>,
    ) -> Result<RecoveryInfo> {
        if first_lsn > next_lsn {
            return Err(AriesError::InvalidArgument(format!(
                "Recovery range starts at {first_lsn} after its end {next_lsn}"
            )));
        }

        self.writer.lock().reset(next_lsn);
        self.set_first_lsn(first_lsn);

        RecoveryEngine::new(self, first_lsn, next_lsn).run(&self.checkpointer, persist)
    }

    /// Forces the log, flushes every page and truncates the log.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub fn checkpoint(
        &self,
        persist: impl FnOnce(LogSequenceNumber, LogSequenceNumber) -> Result<()>,
    ) -> Result<LogSequenceNumber> {
        self.checkpointer.truncate(self, persist)
    }
}

/// Checks that changes to `page_id` fit in an update record and returns
/// the page number as logged.
///
/// # Errors
///
/// Returns [`AriesError::InvalidArgument`] if the page number exceeds
/// 65535 or the file name is longer than [`MAX_FILE_NAME_LEN`] bytes.
pub fn check_loggable(page_id: &PageId) -> Result<u16> {
    if page_id.file_name.len() > MAX_FILE_NAME_LEN {
        return Err(AriesError::InvalidArgument(format!(
            "{page_id} cannot be logged: file name exceeds {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    page_id.loggable_page_no().ok_or_else(|| {
        AriesError::InvalidArgument(format!("{page_id} cannot be logged: page number exceeds 65535"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DiskManager;
    use tempfile::TempDir;

    fn create_test_wal() -> (WalManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path()).unwrap());
        let pool = Arc::new(BufferPool::new(16, Arc::clone(&dm)).unwrap());
        let store = Arc::new(WalFileStore::new(dm, 1 << 20).unwrap());
        (WalManager::new(pool, store, false), temp_dir)
    }

    fn started(wal: &WalManager, txn_id: u32) -> TransactionContext {
        let mut ctx = TransactionContext::new();
        ctx.begin(txn_id, true);
        wal.write_txn_record(&mut ctx, WalRecordType::StartTxn).unwrap();
        ctx
    }

    #[test]
    fn test_txn_record_updates_context() {
        let (wal, _temp) = create_test_wal();
        let mut ctx = started(&wal, 1);
        assert!(ctx.logged_start);
        assert_eq!(ctx.last_lsn, Some(LogSequenceNumber::new(0, 6)));

        let commit = wal.write_txn_record(&mut ctx, WalRecordType::CommitTxn).unwrap();
        assert_eq!(ctx.last_lsn, Some(commit));
        assert_eq!(wal.next_lsn(), LogSequenceNumber::new(0, 24));
    }

    #[test]
    fn test_commit_requires_prev_lsn() {
        let (wal, _temp) = create_test_wal();
        assert!(matches!(
            wal.write_txn_record_for(WalRecordType::CommitTxn, 1, None),
            Err(AriesError::InvalidArgument(_))
        ));
        assert!(matches!(
            wal.write_txn_record_for(WalRecordType::UpdatePage, 1, None),
            Err(AriesError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_txn_record_without_transaction() {
        let (wal, _temp) = create_test_wal();
        let mut ctx = TransactionContext::new();
        assert!(matches!(
            wal.write_txn_record(&mut ctx, WalRecordType::StartTxn),
            Err(AriesError::IllegalState(_))
        ));
    }

    #[test]
    fn test_update_page_record() {
        let (wal, _temp) = create_test_wal();
        let mut ctx = started(&wal, 1);

        let mut page = wal.buffer_pool().pin(&PageId::new("t.tbl", 0)).unwrap();
        page.write(10, &[0xFF]).unwrap();
        let lsn = wal.write_update_page_record(&mut ctx, &page).unwrap();

        assert_eq!(page.page_lsn(), Some(lsn));
        assert!(!page.has_unlogged_changes());
        assert_eq!(ctx.last_lsn, Some(lsn));

        let (record, _, _) = wal.reader().read_record(lsn).unwrap();
        match record {
            WalRecord::UpdatePage {
                prev_lsn, segments, ..
            } => {
                assert_eq!(prev_lsn, LogSequenceNumber::new(0, 6));
                assert_eq!(
                    segments,
                    vec![UpdateSegment {
                        offset: 10,
                        old_data: vec![0],
                        new_data: vec![0xFF],
                    }]
                );
            }
            other => panic!("unexpected record {other}"),
        }
    }

    #[test]
    fn test_update_page_preconditions() {
        let (wal, _temp) = create_test_wal();
        let page = wal.buffer_pool().pin(&PageId::new("t.tbl", 0)).unwrap();

        let mut ctx = started(&wal, 1);
        assert!(matches!(
            wal.write_update_page_record(&mut ctx, &page),
            Err(AriesError::IllegalState(_))
        ));

        let mut page = page;
        page.write(0, &[1]).unwrap();
        let mut idle = TransactionContext::new();
        assert!(matches!(
            wal.write_update_page_record(&mut idle, &page),
            Err(AriesError::IllegalState(_))
        ));
    }

    #[test]
    fn test_unloggable_page_number() {
        let (wal, _temp) = create_test_wal();
        let mut ctx = started(&wal, 1);
        let mut page = wal.buffer_pool().pin(&PageId::new("t.tbl", 70_000)).unwrap();
        page.write(0, &[1]).unwrap();
        assert!(matches!(
            wal.write_update_page_record(&mut ctx, &page),
            Err(AriesError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rollback_restores_page() {
        let (wal, _temp) = create_test_wal();
        let page_id = PageId::new("t.tbl", 0);
        let mut ctx = started(&wal, 1);

        for value in [1u8, 2, 3] {
            let mut page = wal.buffer_pool().pin(&page_id).unwrap();
            page.write(5, &[value]).unwrap();
            wal.write_update_page_record(&mut ctx, &page).unwrap();
        }

        wal.rollback_transaction(&mut ctx).unwrap();
        assert!(ctx.last_lsn.is_none());

        let page = wal.buffer_pool().pin(&page_id).unwrap();
        assert_eq!(page.data()[5], 0);

        // Three compensation records followed by the abort.
        let mut reader = wal.reader();
        let end = wal.next_lsn();
        let abort = reader.step_back(end, LogSequenceNumber::new(0, 6)).unwrap().unwrap();
        let (record, _, _) = reader.read_record(abort).unwrap();
        assert_eq!(record.record_type(), WalRecordType::AbortTxn);

        let (clr, _, _) = reader.read_record(record.prev_lsn().unwrap()).unwrap();
        assert_eq!(clr.record_type(), WalRecordType::UpdatePageRedoOnly);
    }

    #[test]
    fn test_rollback_resumes_after_partial_rollback() {
        let (wal, _temp) = create_test_wal();
        let page_id = PageId::new("t.tbl", 0);
        let mut ctx = started(&wal, 1);

        for (offset, value) in [(5usize, 1u8), (6, 2), (7, 3)] {
            let mut page = wal.buffer_pool().pin(&page_id).unwrap();
            page.write(offset, &[value]).unwrap();
            wal.write_update_page_record(&mut ctx, &page).unwrap();
        }

        // First rollback attempt only got through the newest update.
        let segment = UpdateSegment {
            offset: 7,
            old_data: vec![0],
            new_data: vec![3],
        };
        let tip = ctx.last_lsn.unwrap();
        ctx.last_lsn = Some(wal.undo_update(1, tip, &page_id, &[segment]).unwrap());

        wal.rollback_transaction(&mut ctx).unwrap();
        let page = wal.buffer_pool().pin(&page_id).unwrap();
        assert_eq!(&page.data()[5..8], &[0, 0, 0]);
        drop(page);

        let mut reader = wal.reader();
        let mut lsn = LogSequenceNumber::new(0, 6);
        let mut compensations = 0;
        while lsn < wal.next_lsn() {
            let (record, _, next) = reader.read_record(lsn).unwrap();
            if record.record_type() == WalRecordType::UpdatePageRedoOnly {
                compensations += 1;
            }
            lsn = next;
        }
        assert_eq!(compensations, 3);
    }

    #[test]
    fn test_rollback_without_transaction_is_noop() {
        let (wal, _temp) = create_test_wal();
        let mut ctx = TransactionContext::new();
        wal.rollback_transaction(&mut ctx).unwrap();
        assert_eq!(wal.next_lsn(), LogSequenceNumber::new(0, 6));
    }

    #[test]
    fn test_rollback_detects_foreign_record() {
        let (wal, _temp) = create_test_wal();
        let _other = started(&wal, 2);
        let mut ctx = TransactionContext::new();
        ctx.begin(1, true);
        ctx.last_lsn = Some(LogSequenceNumber::new(0, 6));

        let err = wal.rollback_transaction(&mut ctx).unwrap_err();
        assert!(err.is_corrupt_log());
    }
}
