//! One buffer pool slot: a cached page plus its logging state.

use crate::storage::page::{PageId, PAGE_SIZE};
use crate::storage::wal::LogSequenceNumber;

/// A cached page and the bookkeeping the write-ahead rule needs.
///
/// `page_data` is what readers see. `old_data` is the page as of its last
/// logged change (or as loaded), so their difference is exactly what the
/// next update record must describe.
#[derive(Debug)]
pub struct BufferFrame {
    /// Slot index in the pool.
    pub frame_id: usize,
    /// Page held by this slot; `None` when free.
    pub page_id: Option<PageId>,
    pub page_data: Box<[u8; PAGE_SIZE]>,
    pub old_data: Box<[u8; PAGE_SIZE]>,
    /// Outstanding `PageHandle`s.
    pub pin_count: u32,
    /// Differs from the copy on disk.
    pub dirty: bool,
    /// Last log record applied to the page, with its size when known.
    pub page_lsn: Option<LogSequenceNumber>,
}

impl BufferFrame {
    #[must_use]
    pub fn new(frame_id: usize) -> Self {
        Self {
            frame_id,
            page_id: None,
            page_data: Box::new([0u8; PAGE_SIZE]),
            old_data: Box::new([0u8; PAGE_SIZE]),
            pin_count: 0,
            dirty: false,
            page_lsn: None,
        }
    }

    /// Installs a page read from disk; both images start equal.
    pub fn load(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) {
        *self.page_data = *data;
        *self.old_data = *data;
        self.page_id = Some(page_id);
        self.pin_count = 0;
        self.dirty = false;
        self.page_lsn = None;
    }

    pub fn acquire(&mut self) {
        self.pin_count = self.pin_count.saturating_add(1);
    }

    /// Drops one pin. Returns true when the frame became unpinned.
    pub fn release(&mut self) -> bool {
        if self.pin_count == 0 {
            return false;
        }
        self.pin_count -= 1;
        self.pin_count == 0
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.page_id.is_none()
    }

    #[must_use]
    pub fn can_evict(&self) -> bool {
        !self.is_free() && self.pin_count == 0
    }

    /// True when the current image holds bytes no log record describes yet.
    #[must_use]
    pub fn has_unlogged_changes(&self) -> bool {
        self.page_data[..] != self.old_data[..]
    }

    /// Records that every current byte is now covered by the log.
    pub fn mark_logged(&mut self, lsn: LogSequenceNumber) {
        self.page_lsn = Some(lsn);
        *self.old_data = *self.page_data;
    }

    /// Throws away changes no log record describes.
    pub fn revert_unlogged(&mut self) {
        *self.page_data = *self.old_data;
    }

    /// Forgets the page. Dirty contents must be written first.
    pub fn clear(&mut self) {
        self.page_id = None;
        self.page_lsn = None;
        self.pin_count = 0;
        self.dirty = false;
        self.page_data.fill(0);
        self.old_data.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(byte: u8) -> BufferFrame {
        let mut frame = BufferFrame::new(3);
        let mut data = [0u8; PAGE_SIZE];
        data[7] = byte;
        frame.load(PageId::new("t.tbl", 1), &data);
        frame
    }

    #[test]
    fn test_free_frame_cannot_be_evicted() {
        let frame = BufferFrame::new(0);
        assert!(frame.is_free());
        assert!(!frame.can_evict());
        assert!(frame.page_lsn.is_none());
    }

    #[test]
    fn test_release_reports_last_pin() {
        let mut frame = loaded(0);
        frame.acquire();
        frame.acquire();
        assert!(!frame.can_evict());

        assert!(!frame.release());
        assert!(frame.release());
        assert!(frame.can_evict());

        // Extra releases are ignored.
        assert!(!frame.release());
        assert_eq!(frame.pin_count, 0);
    }

    #[test]
    fn test_mark_logged_syncs_old_image() {
        let mut frame = loaded(3);
        assert!(!frame.has_unlogged_changes());

        frame.page_data[7] = 4;
        frame.dirty = true;
        assert!(frame.has_unlogged_changes());
        assert_eq!(frame.old_data[7], 3);

        let lsn = LogSequenceNumber::new(0, 6).with_record_size(40);
        frame.mark_logged(lsn);
        assert!(!frame.has_unlogged_changes());
        assert_eq!(frame.old_data[7], 4);
        assert_eq!(frame.page_lsn.and_then(|l| l.record_size()), Some(40));
        // Still needs writing.
        assert!(frame.dirty);
    }

    #[test]
    fn test_revert_unlogged_restores_old_image() {
        let mut frame = loaded(3);
        frame.page_data[7] = 8;
        frame.page_data[100] = 1;
        frame.dirty = true;

        frame.revert_unlogged();
        assert_eq!(frame.page_data[7], 3);
        assert_eq!(frame.page_data[100], 0);
        assert!(!frame.has_unlogged_changes());
    }

    #[test]
    fn test_clear_then_reload() {
        let mut frame = loaded(9);
        frame.mark_logged(LogSequenceNumber::new(2, 100));
        frame.clear();
        assert!(frame.is_free());
        assert!(frame.page_lsn.is_none());

        let frame = {
            let mut f = frame;
            f.load(PageId::new("u.tbl", 0), &[1u8; PAGE_SIZE]);
            f
        };
        assert_eq!(frame.page_data[0], 1);
        assert!(!frame.has_unlogged_changes());
    }
}
