//! Redo/undo crash recovery over a bounded range of the log.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{AriesError, Result};
use crate::storage::page::PageId;
use crate::storage::wal::{Checkpointer, LogSequenceNumber, WalManager, WalRecord, WalRecordType};

/// State gathered while recovering `[first_lsn, next_lsn)`.
///
/// Built fresh per run. The redo pass fills in `incomplete_txns`; the undo
/// pass drains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Start of the recovered range.
    pub first_lsn: LogSequenceNumber,
    /// End (exclusive) of the recovered range.
    pub next_lsn: LogSequenceNumber,
    /// Largest transaction ID seen in the range.
    pub max_transaction_id: Option<u32>,
    /// Transactions without a commit or abort, with their newest LSN.
    pub incomplete_txns: HashMap<u32, LogSequenceNumber>,
    /// Number of records replayed by the redo pass.
    pub records_redone: usize,
    /// Number of page changes rolled back by the undo pass.
    pub records_undone: usize,
    /// Transactions aborted by the undo pass, in the order they finished.
    pub aborted_txns: Vec<u32>,
}

impl RecoveryInfo {
    /// Creates empty recovery state for the given range.
    #[must_use]
    pub fn new(first_lsn: LogSequenceNumber, next_lsn: LogSequenceNumber) -> Self {
        Self {
            first_lsn,
            next_lsn,
            max_transaction_id: None,
            incomplete_txns: HashMap::new(),
            records_redone: 0,
            records_undone: 0,
            aborted_txns: Vec::new(),
        }
    }

    fn saw_txn(&mut self, txn_id: u32) {
        self.max_transaction_id = Some(self.max_transaction_id.map_or(txn_id, |m| m.max(txn_id)));
    }

    /// Records the newest LSN of a transaction that has not ended.
    pub fn update_txn(&mut self, txn_id: u32, lsn: LogSequenceNumber) {
        self.saw_txn(txn_id);
        self.incomplete_txns.insert(txn_id, lsn);
    }

    /// Records that a transaction committed or aborted.
    pub fn end_txn(&mut self, txn_id: u32) {
        self.saw_txn(txn_id);
        self.incomplete_txns.remove(&txn_id);
    }

    /// Returns true if the transaction started but has not ended.
    #[must_use]
    pub fn is_txn_incomplete(&self, txn_id: u32) -> bool {
        self.incomplete_txns.contains_key(&txn_id)
    }

    /// Returns the newest LSN recorded for an incomplete transaction.
    #[must_use]
    pub fn last_lsn(&self, txn_id: u32) -> Option<LogSequenceNumber> {
        self.incomplete_txns.get(&txn_id).copied()
    }

    /// Returns true if any transaction still needs to be undone.
    #[must_use]
    pub fn has_incomplete_txns(&self) -> bool {
        !self.incomplete_txns.is_empty()
    }
}

/// Phase of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Not started.
    Idle,
    /// Replaying records forward from `first_lsn`.
    Redoing,
    /// Rolling back incomplete transactions from the end of the log.
    Undoing,
    /// Log forced, pages flushed, `first_lsn` moved to `next_lsn`.
    Complete,
}

/// Drives one recovery run through its phases.
pub struct RecoveryEngine<'a> {
    wal: &'a WalManager,
    info: RecoveryInfo,
    phase: RecoveryPhase,
}

impl<'a> RecoveryEngine<'a> {
    /// Prepares recovery of `[first_lsn, next_lsn)`.
    #[must_use]
    pub fn new(wal: &'a WalManager, first_lsn: LogSequenceNumber, next_lsn: LogSequenceNumber) -> Self {
        Self {
            wal,
            info: RecoveryInfo::new(first_lsn, next_lsn),
            phase: RecoveryPhase::Idle,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Returns the state gathered so far.
    #[must_use]
    pub fn info(&self) -> &RecoveryInfo {
        &self.info
    }

    /// Runs every phase to completion.
    ///
    /// `persist` receives the new `(first_lsn, next_lsn)` pair once the log
    /// has been truncated.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole run; the database must not come online.
    pub fn run(
        mut self,
        checkpointer: &Checkpointer,
        persist: impl FnOnce(LogSequenceNumber, LogSequenceNumber) -> Result<()>,
    ) -> Result<RecoveryInfo> {
        let (first_lsn, next_lsn) = (self.info.first_lsn, self.info.next_lsn);
        if first_lsn == next_lsn {
            info!(%first_lsn, "WAL is empty, nothing to recover");
        } else {
            self.redo()?;
            self.undo()?;
        }

        checkpointer.truncate(self.wal, persist)?;
        self.phase = RecoveryPhase::Complete;
        info!(
            redone = self.info.records_redone,
            undone = self.info.records_undone,
            aborted = self.info.aborted_txns.len(),
            "Recovery complete"
        );
        Ok(self.info)
    }

    fn redo(&mut self) -> Result<()> {
        self.phase = RecoveryPhase::Redoing;
        let (first_lsn, next_lsn) = (self.info.first_lsn, self.info.next_lsn);
        info!(%first_lsn, %next_lsn, "Starting redo pass");

        let mut reader = self.wal.reader();
        let mut lsn = first_lsn;

        while lsn < next_lsn {
            let (record, at, following) = reader.read_record(lsn)?;
            debug!(lsn = %at, %record, "Redo");

            match &record {
                WalRecord::StartTxn { txn_id } => self.info.update_txn(*txn_id, at),
                WalRecord::UpdatePage {
                    txn_id,
                    file_name,
                    page_no,
                    segments,
                    ..
                } => {
                    let page_id = PageId::new(file_name.as_str(), u32::from(*page_no));
                    self.wal.redo_page(
                        &page_id,
                        at,
                        segments.iter().map(|s| (s.offset, s.new_data.as_slice())),
                    )?;
                    self.info.update_txn(*txn_id, at);
                }
                WalRecord::UpdatePageRedoOnly {
                    txn_id,
                    file_name,
                    page_no,
                    segments,
                    ..
                } => {
                    let page_id = PageId::new(file_name.as_str(), u32::from(*page_no));
                    self.wal.redo_page(
                        &page_id,
                        at,
                        segments.iter().map(|s| (s.offset, s.data.as_slice())),
                    )?;
                    self.info.update_txn(*txn_id, at);
                }
                WalRecord::CommitTxn { txn_id, .. } | WalRecord::AbortTxn { txn_id, .. } => {
                    self.info.end_txn(*txn_id);
                }
            }

            self.info.records_redone += 1;
            lsn = following;
        }

        if lsn != next_lsn {
            return Err(AriesError::corrupt(
                lsn,
                format!("redo pass ended at {lsn} but the log should end at {next_lsn}"),
            ));
        }
        Ok(())
    }

    fn undo(&mut self) -> Result<()> {
        self.phase = RecoveryPhase::Undoing;
        if !self.info.has_incomplete_txns() {
            return Ok(());
        }

        let first_lsn = self.info.first_lsn;
        let mut end = self.wal.next_lsn();
        info!(
            incomplete = self.info.incomplete_txns.len(),
            from = %end,
            "Starting undo pass"
        );

        // Compensation records seen per transaction whose updates have not
        // been reached yet. A transaction's compensations follow all of its
        // updates and undo them newest first, so each one cancels the
        // newest update still ahead of the scan.
        let mut compensated: HashMap<u32, usize> = HashMap::new();
        let mut reader = self.wal.reader();
        while self.info.has_incomplete_txns() {
            let Some(lsn) = reader.step_back(end, first_lsn)? else {
                break;
            };
            end = lsn;

            let (record, at, _) = reader.read_record(lsn)?;
            let txn_id = record.txn_id();
            let Some(last_lsn) = self.info.last_lsn(txn_id) else {
                continue;
            };

            match record {
                WalRecord::UpdatePage {
                    file_name,
                    page_no,
                    segments,
                    ..
                } => {
                    if take_compensation(&mut compensated, txn_id) {
                        debug!(lsn = %at, txn_id, "Update already compensated");
                        continue;
                    }
                    let page_id = PageId::new(file_name, u32::from(page_no));
                    let clr = self.wal.undo_update(txn_id, last_lsn, &page_id, &segments)?;
                    debug!(lsn = %at, compensation = %clr, txn_id, "Undo");
                    self.info.update_txn(txn_id, clr);
                    self.info.records_undone += 1;
                }
                WalRecord::UpdatePageRedoOnly { .. } => {
                    *compensated.entry(txn_id).or_default() += 1;
                }
                WalRecord::StartTxn { .. } => {
                    self.abort_txn(txn_id, last_lsn)?;
                }
                WalRecord::CommitTxn { .. } | WalRecord::AbortTxn { .. } => {
                    return Err(AriesError::corrupt(
                        at,
                        format!("transaction {txn_id} ended but was still marked incomplete"),
                    ));
                }
            }
        }

        // Transactions whose start lies before first_lsn.
        let mut leftover: Vec<(u32, LogSequenceNumber)> =
            self.info.incomplete_txns.iter().map(|(&t, &l)| (t, l)).collect();
        leftover.sort_unstable();
        for (txn_id, last_lsn) in leftover {
            warn!(txn_id, "Start of incomplete transaction not found in the log");
            self.abort_txn(txn_id, last_lsn)?;
        }
        Ok(())
    }

    fn abort_txn(&mut self, txn_id: u32, last_lsn: LogSequenceNumber) -> Result<()> {
        let lsn = self
            .wal
            .write_txn_record_for(WalRecordType::AbortTxn, txn_id, Some(last_lsn))?;
        info!(txn_id, %lsn, "Aborted incomplete transaction");
        self.info.end_txn(txn_id);
        self.info.aborted_txns.push(txn_id);
        Ok(())
    }
}

/// Consumes one pending compensation of `txn_id`, if any.
fn take_compensation(compensated: &mut HashMap<u32, usize>, txn_id: u32) -> bool {
    match compensated.get_mut(&txn_id) {
        Some(pending) if *pending > 0 => {
            *pending -= 1;
            true
        }
        _ => false,
    }
}
