//! Page store the write-ahead log protects.
//!
//! Data lives in named files inside the database directory, each an array
//! of [`PAGE_SIZE`] pages. A page is addressed by `(file name, page no)`.

mod disk_manager;
mod page_id;

pub use disk_manager::{DbFile, DiskManager};
pub use page_id::PageId;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`], recorded in typed file headers.
pub const PAGE_SIZE_LOG2: u8 = 12;

/// One page image on its way between disk and the buffer pool.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// A zero-filled image, which is also what unwritten pages read as.
    #[must_use]
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.data.iter().filter(|&&b| b != 0).count();
        write!(f, "Page({}, {used} non-zero bytes)", self.id)
    }
}
