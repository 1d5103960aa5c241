//! Page cache between the page store and the write-ahead log.
//!
//! Callers pin a page, change it through the returned [`PageHandle`] and
//! hand the handle to the transaction layer, which logs the bytes that
//! differ from the frame's old image. Dirty pages only leave the pool
//! (flush or LRU eviction) after the registered [`BufferPoolObserver`]
//! has made their log records durable.
//!
//! ```ignore
//! let pool = BufferPool::new(frames, disk_manager)?;
//! let mut page = pool.pin(&PageId::new("t.tbl", 0))?;
//! page.write(10, &[0xFF])?;
//! txn_manager.record_page_update(&mut ctx, &page)?;
//! ```

mod buffer_frame;
mod eviction;

pub use buffer_frame::BufferFrame;
pub use eviction::LruEvictionQueue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::warn;

use crate::error::{AriesError, Result};
use crate::storage::page::{DiskManager, PageId, PAGE_SIZE};
use crate::storage::wal::LogSequenceNumber;

/// Hook invoked before dirty pages are written to disk.
///
/// Implementations enforce the write-ahead rule: every log record that
/// describes a change to one of the pages must be durable before the
/// page itself is written.
pub trait BufferPoolObserver: Send + Sync {
    /// Called with the ID and page LSN of each dirty page about to be written.
    ///
    /// # Errors
    ///
    /// An error aborts the page write.
    fn before_write_dirty_pages(
        &self,
        pages: &[(PageId, Option<LogSequenceNumber>)],
    ) -> Result<()>;
}

/// Fixed set of page frames with LRU replacement.
///
/// Lock order: `page_table`, then `eviction_queue`, then a frame.
pub struct BufferPool {
    frames: Vec<RwLock<BufferFrame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    /// Unpinned frames, least recently used first.
    eviction_queue: Mutex<LruEvictionQueue>,
    capacity: usize,
    disk_manager: Arc<DiskManager>,
    /// Write-ahead hook, held weakly.
    observer: RwLock<Option<Weak<dyn BufferPoolObserver>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool with the given capacity and disk manager.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of pages to cache in memory
    /// * `disk_manager` - Disk manager for reading/writing pages
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is zero.
    pub fn new(capacity: usize, disk_manager: Arc<DiskManager>) -> Result<Self> {
        if capacity == 0 {
            return Err(AriesError::BufferPoolError(
                "Buffer pool capacity must be greater than 0".into(),
            ));
        }

        let frames = (0..capacity)
            .map(|i| RwLock::new(BufferFrame::new(i)))
            .collect();

        Ok(Self {
            frames,
            page_table: RwLock::new(HashMap::with_capacity(capacity)),
            eviction_queue: Mutex::new(LruEvictionQueue::new(capacity)),
            capacity,
            disk_manager,
            observer: RwLock::new(None),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Registers the hook called before dirty pages are written.
    pub fn set_observer(&self, observer: Weak<dyn BufferPoolObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Returns the disk manager backing this pool.
    #[must_use]
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Returns the capacity of the buffer pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of pages currently in the buffer pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.page_table.read().len()
    }

    /// Pins a page in the buffer pool, loading it from disk if necessary.
    ///
    /// Pages past the end of their file load as zeroes; the file is created
    /// if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or no frames are available.
    pub fn pin(&self, page_id: &PageId) -> Result<PageHandle<'_>> {
        {
            let page_table = self.page_table.read();
            if let Some(&frame_idx) = page_table.get(page_id) {
                return Ok(self.pin_cached(frame_idx, page_id));
            }
        }

        // Loads are serialized on the page table so a page is never cached twice.
        let mut page_table = self.page_table.write();
        if let Some(&frame_idx) = page_table.get(page_id) {
            return Ok(self.pin_cached(frame_idx, page_id));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let frame_idx = self.find_or_evict_frame(&mut page_table)?;
        let page = self.disk_manager.read_page(page_id)?;

        {
            let mut frame = self.frames[frame_idx].write();
            frame.load(page_id.clone(), &page.data);
            frame.acquire();
        }
        page_table.insert(page_id.clone(), frame_idx);

        Ok(PageHandle {
            pool: self,
            frame_idx,
            page_id: page_id.clone(),
        })
    }

    fn pin_cached(&self, frame_idx: usize, page_id: &PageId) -> PageHandle<'_> {
        self.frames[frame_idx].write().acquire();
        self.eviction_queue.lock().remove(frame_idx);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        PageHandle {
            pool: self,
            frame_idx,
            page_id: page_id.clone(),
        }
    }

    /// Returns the IDs of every dirty page in the pool.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.frames
            .iter()
            .filter_map(|frame_lock| {
                let frame = frame_lock.read();
                if frame.dirty {
                    frame.page_id.clone()
                } else {
                    None
                }
            })
            .collect()
    }

    /// Flushes a specific page to disk if it's dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the write-ahead hook or the page write fails.
    pub fn flush_page(&self, page_id: &PageId) -> Result<()> {
        let frame_idx = match self.page_table.read().get(page_id) {
            Some(&idx) => idx,
            None => return Ok(()), // Page not in pool, nothing to flush
        };

        let mut frame = self.frames[frame_idx].write();
        if frame.page_id.as_ref() != Some(page_id) || !frame.dirty {
            return Ok(());
        }
        self.write_frame(&mut frame)
    }

    /// Flushes all dirty pages to disk, optionally syncing every open file.
    ///
    /// # Errors
    ///
    /// Returns an error if any page cannot be written to disk.
    pub fn flush_all(&self, sync: bool) -> Result<()> {
        let page_ids: Vec<PageId> = self.page_table.read().keys().cloned().collect();

        for page_id in &page_ids {
            self.flush_page(page_id)?;
        }

        if sync {
            self.disk_manager.sync_all()?;
        }
        Ok(())
    }

    /// Writes one dirty frame, running the write-ahead hook first.
    fn write_frame(&self, frame: &mut BufferFrame) -> Result<()> {
        let Some(page_id) = frame.page_id.clone() else {
            return Ok(());
        };

        if frame.page_lsn.is_none() && frame.has_unlogged_changes() {
            warn!(page = %page_id, "Writing dirty page with unlogged changes");
        }

        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.before_write_dirty_pages(&[(page_id.clone(), frame.page_lsn)])?;
        }

        let file = self.disk_manager.open_or_create(&page_id.file_name)?;
        file.write_at(page_id.offset(), &frame.page_data[..])?;
        frame.dirty = false;
        Ok(())
    }

    /// Internal: Unpins a page (called when `PageHandle` is dropped).
    fn unpin(&self, frame_idx: usize) {
        // Frame lock is released before the queue lock is taken.
        let now_unpinned = self.frames[frame_idx].write().release();

        if now_unpinned {
            self.eviction_queue.lock().touch(frame_idx);
        }
    }

    /// Internal: Finds an empty frame or evicts one.
    fn find_or_evict_frame(&self, page_table: &mut HashMap<PageId, usize>) -> Result<usize> {
        for (idx, frame_lock) in self.frames.iter().enumerate() {
            if frame_lock.read().is_free() {
                return Ok(idx);
            }
        }

        self.evict_frame(page_table)
    }

    /// Internal: Evicts the least recently unpinned frame.
    fn evict_frame(&self, page_table: &mut HashMap<PageId, usize>) -> Result<usize> {
        let victim = self
            .eviction_queue
            .lock()
            .pop_victim(|idx| self.frames[idx].read().can_evict());

        let Some(frame_idx) = victim else {
            return Err(AriesError::BufferPoolError(
                "Buffer pool is full and no pages can be evicted".into(),
            ));
        };

        let mut frame = self.frames[frame_idx].write();
        if frame.dirty {
            self.write_frame(&mut frame)?;
        }
        if let Some(page_id) = frame.page_id.take() {
            page_table.remove(&page_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        frame.clear();

        Ok(frame_idx)
    }

    /// Returns buffer pool statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let pages_used = self.page_table.read().len();
        let mut dirty_pages = 0;
        let mut pinned_pages = 0;

        for frame_lock in &self.frames {
            let frame = frame_lock.read();
            if frame.page_id.is_some() {
                if frame.dirty {
                    dirty_pages += 1;
                }
                if frame.pin_count > 0 {
                    pinned_pages += 1;
                }
            }
        }

        BufferPoolStats {
            capacity: self.capacity,
            pages_used,
            dirty_pages,
            pinned_pages,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A pinned page. The frame cannot be evicted while a handle exists.
pub struct PageHandle<'a> {
    pool: &'a BufferPool,
    frame_idx: usize,
    page_id: PageId,
}

impl PageHandle<'_> {
    fn frame(&self) -> RwLockReadGuard<'_, BufferFrame> {
        self.pool.frames[self.frame_idx].read()
    }

    fn check_bounds(offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(AriesError::InvalidArgument(format!(
                "Page access of {len} bytes at offset {offset} exceeds page size {PAGE_SIZE}"
            ))),
        }
    }

    /// Returns the page ID.
    #[must_use]
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// Returns the current page image.
    #[must_use]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.frame(), |frame| &frame.page_data[..])
    }

    /// Returns the page image as of the last logged change (or load).
    #[must_use]
    pub fn old_data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.frame(), |frame| &frame.old_data[..])
    }

    /// Runs `f` with the old and current images under a single lock.
    pub fn with_images<R>(&self, f: impl FnOnce(&[u8], &[u8]) -> R) -> R {
        let frame = self.frame();
        f(&frame.old_data[..], &frame.page_data[..])
    }

    /// Copies `len` bytes starting at `offset` out of the current image.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] if the range leaves the page.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        Self::check_bounds(offset, len)?;
        Ok(self.frame().page_data[offset..offset + len].to_vec())
    }

    /// Overwrites bytes of the current image and marks the page dirty.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::InvalidArgument`] if the range leaves the page.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        Self::check_bounds(offset, data.len())?;
        let mut frame = self.pool.frames[self.frame_idx].write();
        frame.page_data[offset..offset + data.len()].copy_from_slice(data);
        frame.dirty = true;
        Ok(())
    }

    /// Returns whether the page has been modified since it was last written.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.frame().dirty
    }

    /// Returns whether the current image differs from the old image.
    #[must_use]
    pub fn has_unlogged_changes(&self) -> bool {
        self.frame().has_unlogged_changes()
    }

    /// Returns the LSN of the last log record that touched this page.
    #[must_use]
    pub fn page_lsn(&self) -> Option<LogSequenceNumber> {
        self.frame().page_lsn
    }

    /// Records the LSN of the newest log record describing this page.
    pub fn set_page_lsn(&self, lsn: LogSequenceNumber) {
        self.pool.frames[self.frame_idx].write().page_lsn = Some(lsn);
    }

    /// Makes the old image match the current image.
    pub fn sync_old_data(&self) {
        let mut guard = self.pool.frames[self.frame_idx].write();
        let frame = &mut *guard;
        frame.old_data.copy_from_slice(&frame.page_data[..]);
    }

    /// Restores the old image, dropping every change not yet logged.
    pub fn revert_unlogged(&self) {
        self.pool.frames[self.frame_idx].write().revert_unlogged();
    }

    /// Sets the page LSN and syncs the old image in one step, after the
    /// record describing the current image has been appended.
    pub fn mark_logged(&self, lsn: LogSequenceNumber) {
        self.pool.frames[self.frame_idx].write().mark_logged(lsn);
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_idx);
    }
}

/// Point-in-time counters; frame counts are gathered without a global
/// lock and may be slightly inconsistent under concurrent use.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Frames in the pool.
    pub capacity: usize,
    /// Frames holding a page.
    pub pages_used: usize,
    /// Pages not yet written back.
    pub dirty_pages: usize,
    pub pinned_pages: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Pages pushed out to make room, dirty or clean.
    pub evictions: u64,
}

impl BufferPoolStats {
    /// Fraction of pins served from memory; `None` before the first pin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            None
        } else {
            Some(self.cache_hits as f64 / total as f64)
        }
    }
}
