//! ariesdb - write-ahead logging and crash recovery for a page store
//!
//! A small storage engine: named page files behind a buffer pool, a
//! segmented write-ahead log, and ARIES-style redo/undo recovery.

pub mod error;
pub mod storage;
pub mod transactions;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

pub use error::{AriesError, Result};
pub use storage::wal::{LogSequenceNumber, Lsn, RecoveryInfo};
pub use storage::{BufferPool, BufferPoolStats, PageHandle, PageId, PAGE_SIZE};
pub use transactions::{TransactionContext, TransactionManager};

use storage::wal::DEFAULT_MAX_WAL_FILE_SIZE;
use storage::DiskManager;

/// Configuration for opening or creating a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Size of the buffer pool in bytes (default: 4MB).
    pub buffer_pool_size: usize,
    /// Cap on the size of one WAL segment file (default: 10MB).
    ///
    /// Must not change while the log holds live records.
    pub wal_segment_size: u32,
    /// Fsync the log when forcing it (default: true).
    pub wal_sync: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: 4 * 1024 * 1024, // 4 MB
            wal_segment_size: DEFAULT_MAX_WAL_FILE_SIZE,
            wal_sync: true,
        }
    }
}

/// A database directory opened for transactional page updates.
///
/// Opening runs crash recovery. Dropping the database closes it cleanly;
/// call [`close`](Self::close) to observe errors.
pub struct Database {
    /// Database directory.
    db_path: PathBuf,
    config: DatabaseConfig,
    buffer_pool: Arc<BufferPool>,
    txn_manager: Arc<TransactionManager>,
    closed: bool,
}

impl Database {
    /// Opens or creates a database at the given path and recovers it.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the page files, WAL segments and
    ///   transaction state
    /// * `config` - Database configuration options
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - The configuration is invalid
    /// - The transaction-state file is damaged
    /// - Recovery fails (the log is corrupt or unreadable)
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Self> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| {
                AriesError::StorageError(format!("Failed to create database directory: {e}"))
            })?;
        }

        let disk_manager = Arc::new(DiskManager::new(path)?);

        // Calculate number of buffer frames from config
        let num_frames = config.buffer_pool_size / PAGE_SIZE;
        let buffer_pool = Arc::new(BufferPool::new(num_frames, disk_manager)?);

        let txn_manager = TransactionManager::new(
            Arc::clone(&buffer_pool),
            config.wal_segment_size,
            config.wal_sync,
        )?;
        let recovery = txn_manager.initialize()?;
        info!(
            path = %path.display(),
            redone = recovery.records_redone,
            undone = recovery.records_undone,
            aborted = recovery.aborted_txns.len(),
            "Opened database"
        );

        Ok(Database {
            db_path: path.to_path_buf(),
            config,
            buffer_pool,
            txn_manager,
            closed: false,
        })
    }

    /// Returns the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Returns the configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the buffer pool.
    #[must_use]
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Returns the transaction manager.
    #[must_use]
    pub fn txn_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    /// Returns the result of the recovery run at open.
    #[must_use]
    pub fn recovery_info(&self) -> Option<RecoveryInfo> {
        self.txn_manager.last_recovery()
    }

    /// Returns buffer pool statistics.
    #[must_use]
    pub fn buffer_pool_stats(&self) -> BufferPoolStats {
        self.buffer_pool.stats()
    }

    /// Pins a page for direct access.
    ///
    /// Changes made through the handle are only protected once passed to
    /// [`record_page_update`](Self::record_page_update).
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded.
    pub fn pin_page(&self, page_id: &PageId) -> Result<PageHandle<'_>> {
        self.buffer_pool.pin(page_id)
    }

    /// Reads `len` bytes of a page starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or the range leaves it.
    pub fn read_page(&self, page_id: &PageId, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.buffer_pool.pin(page_id)?.read(offset, len)
    }

    /// Starts a user transaction.
    ///
    /// # Errors
    ///
    /// Never fails for a fresh context; kept fallible for symmetry with
    /// [`TransactionManager::start_transaction`].
    pub fn begin_transaction(&self) -> Result<TransactionContext> {
        let mut ctx = TransactionContext::new();
        self.txn_manager.start_transaction(&mut ctx, true)?;
        Ok(ctx)
    }

    /// Logs the changes made to a pinned page by the context's transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::record_page_update`].
    pub fn record_page_update(&self, ctx: &mut TransactionContext, page: &PageHandle<'_>) -> Result<()> {
        self.txn_manager.record_page_update(ctx, page)
    }

    /// Writes `data` at `offset` of a page and logs the change.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] if no transaction is in
    /// progress or [`AriesError::InvalidArgument`] if the page cannot be
    /// logged; the page is left untouched in both cases. A failed log write
    /// discards the page's unlogged changes.
    pub fn update_page(
        &self,
        ctx: &mut TransactionContext,
        page_id: &PageId,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        if !ctx.is_in_progress() {
            return Err(AriesError::IllegalState(format!(
                "Cannot update {page_id}: no transaction in progress"
            )));
        }

        storage::wal::check_loggable(page_id)?;

        let mut page = self.buffer_pool.pin(page_id)?;
        page.write(offset, data)?;
        self.txn_manager.record_page_update(ctx, &page)
    }

    /// Commits the context's transaction; durable on return.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::commit_transaction`].
    pub fn commit(&self, ctx: &mut TransactionContext) -> Result<()> {
        self.txn_manager.commit_transaction(ctx)
    }

    /// Rolls back the context's transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::rollback_transaction`].
    pub fn rollback(&self, ctx: &mut TransactionContext) -> Result<()> {
        self.txn_manager.rollback_transaction(ctx)
    }

    /// Flushes every page and truncates the log.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::IllegalState`] while a transaction is in
    /// progress, or any flush/truncation error.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.txn_manager.checkpoint()
    }

    /// Closes the database, checkpointing if no transaction is running.
    ///
    /// This is called automatically when the Database is dropped, but
    /// calling it explicitly allows error handling.
    ///
    /// # Errors
    ///
    /// Returns an error if forcing the log or flushing pages fails.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.txn_manager.shutdown()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Attempt to close gracefully, ignore errors during drop
        let _ = self.close();
    }
}
