//! Log truncation once every logged change is reflected in durable pages.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::error::Result;
use crate::storage::wal::{LogSequenceNumber, WalManager};

/// Moves `first_lsn` up to `next_lsn` and discards log segments that are
/// no longer needed.
///
/// Used at the end of recovery and for explicit checkpoints taken while no
/// transaction is running.
pub struct Checkpointer {
    /// Number of truncations performed.
    completed: AtomicU64,
}

impl Checkpointer {
    /// Creates a new checkpointer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
        }
    }

    /// Returns how many truncations have completed.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Performs a truncation.
    ///
    /// This:
    /// 1. Forces the log through `next_lsn`
    /// 2. Flushes and syncs every dirty page
    /// 3. Sets `first_lsn = next_lsn` and hands the pair to `persist`
    /// 4. Deletes segments wholly before the new `first_lsn`'s segment
    ///
    /// Returns the new `first_lsn`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. Segments are only deleted after
    /// `persist` succeeds.
    pub fn truncate(
        &self,
        wal: &WalManager,
        persist: impl FnOnce(LogSequenceNumber, LogSequenceNumber) -> Result<()>,
    ) -> Result<LogSequenceNumber> {
        let next_lsn = wal.next_lsn();

        wal.force(next_lsn)?;
        wal.buffer_pool().flush_all(true)?;

        wal.set_first_lsn(next_lsn);
        persist(next_lsn, next_lsn)?;

        let removed = wal.store().remove_segments_before(next_lsn.log_file_no())?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(first_lsn = %next_lsn, removed_segments = removed, "Truncated WAL");

        Ok(next_lsn)
    }
}

impl Default for Checkpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer_pool::BufferPool;
    use crate::storage::page::{DiskManager, PageId};
    use crate::storage::wal::{WalFileStore, WalRecord};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_moves_first_lsn_and_removes_segments() {
        let temp_dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path()).unwrap());
        let pool = Arc::new(BufferPool::new(8, Arc::clone(&dm)).unwrap());
        let store = Arc::new(WalFileStore::new(dm, 20).unwrap());
        let wal = WalManager::new(pool, store, true);

        for txn_id in 0..6 {
            wal.append(&WalRecord::StartTxn { txn_id }).unwrap();
        }
        assert!(wal.store().exists(0));
        {
            let mut page = wal.buffer_pool().pin(&PageId::new("t.tbl", 0)).unwrap();
            page.write(0, &[5]).unwrap();
        }

        let checkpointer = Checkpointer::new();
        let mut persisted = None;
        let first = checkpointer
            .truncate(&wal, |f, n| {
                persisted = Some((f, n));
                Ok(())
            })
            .unwrap();

        assert_eq!(first, wal.next_lsn());
        assert_eq!(wal.first_lsn(), first);
        assert_eq!(persisted, Some((first, first)));
        assert!(!wal.store().exists(0));
        assert!(wal.buffer_pool().dirty_pages().is_empty());
        assert_eq!(checkpointer.completed(), 1);
    }
}
