//! Page identifier type.

use std::sync::Arc;

/// Unique identifier for a page in the database.
///
/// A page is identified by:
/// - `file_name`: The data file the page belongs to, relative to the data directory
/// - `page_no`: The page number within the file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    /// Name of the file holding the page.
    pub file_name: Arc<str>,
    /// Page number within the file.
    pub page_no: u32,
}

impl PageId {
    /// Creates a new page ID.
    #[must_use]
    pub fn new(file_name: impl Into<Arc<str>>, page_no: u32) -> Self {
        Self {
            file_name: file_name.into(),
            page_no,
        }
    }

    /// Returns the byte offset of this page within its file.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page_no as u64) * (super::PAGE_SIZE as u64)
    }

    /// Returns the page number narrowed to the 16 bits stored in log records.
    #[must_use]
    pub fn loggable_page_no(&self) -> Option<u16> {
        u16::try_from(self.page_no).ok()
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({}/{})", self.file_name, self.page_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_SIZE;

    #[test]
    fn test_page_id_creation() {
        let id = PageId::new("t.tbl", 42);
        assert_eq!(&*id.file_name, "t.tbl");
        assert_eq!(id.page_no, 42);
    }

    #[test]
    fn test_page_id_offset() {
        assert_eq!(PageId::new("a", 0).offset(), 0);
        assert_eq!(PageId::new("a", 1).offset(), PAGE_SIZE as u64);
        assert_eq!(PageId::new("a", 10).offset(), 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_loggable_page_no() {
        assert_eq!(PageId::new("a", 65_535).loggable_page_no(), Some(65_535));
        assert_eq!(PageId::new("a", 65_536).loggable_page_no(), None);
    }

    #[test]
    fn test_page_id_equality_and_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new("a", 1));
        set.insert(PageId::new("a", 2));
        set.insert(PageId::new("b", 1));
        set.insert(PageId::new("a", 1)); // Duplicate

        assert_eq!(set.len(), 3);
        assert_ne!(PageId::new("a", 1), PageId::new("b", 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(PageId::new("t.tbl", 3).to_string(), "Page(t.tbl/3)");
    }
}
