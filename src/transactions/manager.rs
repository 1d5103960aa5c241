//! Transaction manager: the consumer API over the write-ahead log.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{AriesError, Result};
use crate::storage::buffer_pool::{BufferPool, BufferPoolObserver, PageHandle};
use crate::storage::page::PageId;
use crate::storage::wal::{
    check_loggable, Lsn, RecoveryInfo, WalFileStore, WalManager, WalRecordType,
};
use crate::transactions::{TransactionContext, TxnStateFile};

/// Hands out transaction IDs, logs transaction boundaries and page
/// updates, and keeps the transaction-state file in step with the log.
pub struct TransactionManager {
    wal: WalManager,
    state_file: Mutex<TxnStateFile>,
    next_txn_id: AtomicU32,
    /// Transactions started and not yet committed or rolled back.
    active_txns: AtomicUsize,
    /// Shared by transaction starts, exclusive for a checkpoint, so no
    /// transaction can begin between the idle check and the truncation.
    txn_gate: RwLock<()>,
    last_recovery: Mutex<Option<RecoveryInfo>>,
}

impl TransactionManager {
    /// Creates the manager and registers it as the buffer pool's
    /// write-ahead hook. Call [`initialize`](Self::initialize) before use.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment size is invalid or the state file
    /// cannot be loaded.
    pub fn new(
        buffer_pool: Arc<BufferPool>,
        wal_segment_size: u32,
        wal_sync: bool,
    ) -> Result<Arc<Self>> {
        let disk_manager = Arc::clone(buffer_pool.disk_manager());
        let store = Arc::new(WalFileStore::new(Arc::clone(&disk_manager), wal_segment_size)?);
        let state_file = TxnStateFile::open_or_create(&disk_manager)?;
        let next_txn_id = state_file.state().next_txn_id;

        let manager = Arc::new(Self {
            wal: WalManager::new(Arc::clone(&buffer_pool), store, wal_sync),
            state_file: Mutex::new(state_file),
            next_txn_id: AtomicU32::new(next_txn_id),
            active_txns: AtomicUsize::new(0),
            txn_gate: RwLock::new(()),
            last_recovery: Mutex::new(None),
        });

        let observer: Weak<Self> = Arc::downgrade(&manager);
        buffer_pool.set_observer(observer);
        Ok(manager)
    }

    /// Returns the WAL manager.
    #[must_use]
    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    /// Returns the recovery range stored in the state file.
    #[must_use]
    pub fn stored_lsns(&self) -> (Lsn, Lsn) {
        let state_file = self.state_file.lock();
        (state_file.state().first_lsn, state_file.state().next_lsn)
    }

    /// Returns the ID the next transaction will receive.
    #[must_use]
    pub fn next_txn_id(&self) -> u32 {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    /// Returns the number of transactions in progress.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.active_txns.load(Ordering::SeqCst)
    }

    /// Returns the result of the last recovery run.
    #[must_use]
    pub fn last_recovery(&self) -> Option<RecoveryInfo> {
        self.last_recovery.lock().clone()
    }

    /// Recovers over the range stored in the state file.
    ///
    /// # Errors
    ///
    /// Any recovery error; the database must not be used afterwards.
    pub fn initialize(&self) -> Result<RecoveryInfo> {
        let (first_lsn, next_lsn) = self.stored_lsns();
        self.run_recovery(first_lsn, next_lsn)?;
        self.last_recovery().ok_or_else(|| {
            AriesError::IllegalState("Recovery finished without producing a result".into())
        })
    }

    /// Recovers `[first_lsn, next_lsn)` and returns the new pair.
    ///
    /// Transaction IDs continue past the largest one found in the log.
    ///
    /// # Errors
    ///
    /// Any recovery error; the database must not be used afterwards.
    pub fn run_recovery(&self, first_lsn: Lsn, next_lsn: Lsn) -> Result<(Lsn, Lsn)> {
        let info = self
            .wal
            .do_recovery(first_lsn, next_lsn, |first, next| self.persist_lsns(first, next))?;

        if let Some(max_id) = info.max_transaction_id {
            let next_id = max_id.wrapping_add(1).max(1);
            if self.next_txn_id.fetch_max(next_id, Ordering::SeqCst) < next_id {
                info!(next_txn_id = next_id, "Advanced transaction ID past recovered log");
            }
        }

        let lsns = (self.wal.first_lsn(), self.wal.next_lsn());
        self.persist_lsns(lsns.0, lsns.1)?;
        *self.last_recovery.lock() = Some(info);
        Ok(lsns)
    }

    /// Starts a transaction in `ctx`. Nothing is logged until the first
    /// page update.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if `ctx` already has a
    /// transaction in progress.
    pub fn start_transaction(&self, ctx: &mut TransactionContext, user_started: bool) -> Result<()> {
        if let Some(txn_id) = ctx.transaction_id {
            return Err(AriesError::IllegalState(format!(
                "Transaction {txn_id} is already in progress"
            )));
        }

        let _gate = self.txn_gate.read();
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        ctx.begin(txn_id, user_started);
        self.active_txns.fetch_add(1, Ordering::SeqCst);
        debug!(txn_id, user_started, "Started transaction");
        Ok(())
    }

    /// Logs the changes made to `page` by the context's transaction.
    ///
    /// Writes the transaction's `StartTxn` record first if needed. Pages
    /// without unlogged changes are skipped. If logging fails the page's
    /// unlogged changes are thrown away, so nothing unlogged can reach disk.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if no transaction is in
    /// progress, or any logging error.
    pub fn record_page_update(&self, ctx: &mut TransactionContext, page: &PageHandle<'_>) -> Result<()> {
        if !page.is_dirty() || !page.has_unlogged_changes() {
            debug!(page = %page.page_id(), "Page has no unlogged changes, skipping");
            return Ok(());
        }
        if !ctx.is_in_progress() {
            return Err(AriesError::IllegalState(format!(
                "Cannot record an update to {}: no transaction in progress",
                page.page_id()
            )));
        }

        let logged = check_loggable(page.page_id()).and_then(|_| {
            if !ctx.logged_start {
                self.wal.write_txn_record(ctx, WalRecordType::StartTxn)?;
            }
            self.wal.write_update_page_record(ctx, page)
        });
        if let Err(e) = logged {
            warn!(page = %page.page_id(), error = %e, "Logging failed, reverting unlogged page changes");
            page.revert_unlogged();
            return Err(e);
        }
        Ok(())
    }

    /// Commits the context's transaction and makes the commit durable.
    ///
    /// A no-op when no transaction is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit record cannot be written or forced.
    pub fn commit_transaction(&self, ctx: &mut TransactionContext) -> Result<()> {
        let Some(txn_id) = ctx.transaction_id else {
            debug!("Commit requested with no transaction in progress");
            return Ok(());
        };

        if ctx.logged_start {
            let lsn = self.wal.write_txn_record(ctx, WalRecordType::CommitTxn)?;
            self.force_wal(lsn.end())?;
        }

        self.finish(ctx);
        debug!(txn_id, "Committed transaction");
        Ok(())
    }

    /// Rolls back the context's transaction.
    ///
    /// A no-op when no transaction is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if undoing fails; [`AriesError::CorruptLog`] if the
    /// transaction's record chain is inconsistent.
    pub fn rollback_transaction(&self, ctx: &mut TransactionContext) -> Result<()> {
        if !ctx.is_in_progress() {
            debug!("Rollback requested with no transaction in progress");
            return Ok(());
        }

        if ctx.logged_start {
            self.wal.rollback_transaction(ctx)?;
        }
        self.finish(ctx);
        Ok(())
    }

    fn finish(&self, ctx: &mut TransactionContext) {
        ctx.clear();
        // Saturate so a stray context cannot wrap the counter.
        let _ = self
            .active_txns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Makes the log durable through `lsn` and records the new durable end
    /// in the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync or the state-file write fails.
    pub fn force_wal(&self, lsn: Lsn) -> Result<()> {
        if let Some(forced) = self.wal.force(lsn)? {
            self.persist_lsns(self.wal.first_lsn(), forced)?;
        }
        Ok(())
    }

    /// Truncates the log while no transaction is running.
    ///
    /// Returns the new `first_lsn`.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if a transaction is in progress.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let _gate = self.txn_gate.write();
        self.checkpoint_idle()
    }

    /// Checkpoints if idle. The caller holds the transaction gate exclusively.
    fn checkpoint_idle(&self) -> Result<Lsn> {
        let active = self.active_transactions();
        if active > 0 {
            return Err(AriesError::IllegalState(format!(
                "Cannot checkpoint with {active} transaction(s) in progress"
            )));
        }
        self.wal.checkpoint(|first, next| self.persist_lsns(first, next))
    }

    /// Leaves the log and pages durable for a clean close.
    ///
    /// Truncates the log when no transaction is running; otherwise forces
    /// the log and flushes every page so the next recovery undoes the
    /// unfinished transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if forcing, flushing or truncating fails.
    pub fn shutdown(&self) -> Result<()> {
        let _gate = self.txn_gate.write();
        let active = self.active_transactions();
        if active == 0 {
            let first_lsn = self.checkpoint_idle()?;
            info!(%first_lsn, "Shut down cleanly");
            return Ok(());
        }

        self.force_wal(self.wal.next_lsn())?;
        self.wal.buffer_pool().flush_all(true)?;
        info!(active, "Shut down with transactions in progress");
        Ok(())
    }

    /// Writes `(first_lsn, next_lsn)` and the next transaction ID to the
    /// state file. Stale ranges (an older `next_lsn`) are ignored.
    fn persist_lsns(&self, first_lsn: Lsn, next_lsn: Lsn) -> Result<()> {
        let mut state_file = self.state_file.lock();
        let current = state_file.state();
        if next_lsn < current.next_lsn && first_lsn <= current.first_lsn {
            return Ok(());
        }

        let mut state = current.clone();
        state.first_lsn = first_lsn;
        state.next_lsn = next_lsn.max(first_lsn);
        state.next_txn_id = self.next_txn_id();
        state_file.write(state)?;
        debug!(%first_lsn, %next_lsn, "Persisted transaction state");
        Ok(())
    }
}

impl BufferPoolObserver for TransactionManager {
    fn before_write_dirty_pages(&self, pages: &[(PageId, Option<Lsn>)]) -> Result<()> {
        let mut target: Option<Lsn> = None;
        for (_, lsn) in pages {
            let Some(lsn) = lsn else { continue };
            let end = if lsn.record_size().is_some() {
                lsn.end()
            } else {
                self.wal.next_lsn()
            };
            target = Some(target.map_or(end, |t| t.max(end)));
        }

        match target {
            Some(lsn) => self.force_wal(lsn),
            None => Ok(()),
        }
    }
}
