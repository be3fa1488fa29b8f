//! In-memory disk manager for tests and ephemeral engines.

use std::collections::HashMap;

use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use silt_types::{PAGE_SIZE, PageData, PageId};

use crate::disk::DiskManager;

/// Disk manager that stores pages in a heap map.
///
/// Cloning the handle shares the underlying storage, mirroring how multiple
/// components share one page file.
#[derive(Debug, Default)]
pub struct MemoryDiskManager {
    pages: Mutex<HashMap<PageId, PageData>>,
}

impl MemoryDiskManager {
    /// Create an empty in-memory disk.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that have ever been written (and not deallocated).
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Snapshot the stored bytes of `page_id`, if any write reached it.
    ///
    /// Test hook: lets assertions inspect "disk" contents without going
    /// through a read buffer.
    #[must_use]
    pub fn stored_page(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages
            .lock()
            .get(&page_id)
            .map(|p| p.as_bytes().to_vec())
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(SiltError::BadPageBuffer {
                expected: PAGE_SIZE,
                actual: buf.len(),
            });
        }
        match self.pages.lock().get(&page_id) {
            Some(page) => buf.copy_from_slice(page.as_bytes()),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(SiltError::BadPageBuffer {
                expected: PAGE_SIZE,
                actual: buf.len(),
            });
        }
        let mut pages = self.pages.lock();
        pages.entry(page_id).or_default().copy_from(buf);
        Ok(())
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        self.pages.lock().remove(&page_id);
        Ok(())
    }
}
