//! Frames and the page handles the buffer pool gives out.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use silt_types::{FrameId, PageData, PageId};

/// One slot in the buffer pool's frame array.
///
/// The page bytes sit behind their own reader/writer latch, orthogonal to
/// the pool latch: executors latch `data` for as long as they read or
/// write tuple bytes, while residency bookkeeping (pin counts, dirty bits,
/// the page table) stays under the pool latch in the manager.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    data: RwLock<PageData>,
}

impl Frame {
    pub(crate) fn new(id: FrameId) -> Self {
        Self {
            id,
            data: RwLock::new(PageData::zeroed()),
        }
    }

    /// This frame's slot index.
    #[inline]
    #[must_use]
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn data(&self) -> &RwLock<PageData> {
        &self.data
    }
}

/// A pinned page, as handed out by
/// [`BufferPoolManager`](crate::BufferPoolManager).
///
/// The handle is only meaningful while the caller holds the pin it was
/// issued with: after `unpin_page` drops the pin count to zero the frame
/// may be evicted and reloaded with a different page. Callers must latch
/// through [`read`](Self::read)/[`write`](Self::write) before touching the
/// bytes and must report writes via the `is_dirty` flag on unpin.
#[derive(Debug, Clone)]
pub struct PageHandle {
    page_id: PageId,
    frame: Arc<Frame>,
}

impl PageHandle {
    pub(crate) fn new(page_id: PageId, frame: Arc<Frame>) -> Self {
        Self { page_id, frame }
    }

    /// The id of the page this handle was issued for.
    #[inline]
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The frame currently backing the page.
    #[inline]
    #[must_use]
    pub fn frame_id(&self) -> FrameId {
        self.frame.id
    }

    /// Acquire the page latch for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, PageData> {
        self.frame.data.read()
    }

    /// Acquire the page latch for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageData> {
        self.frame.data.write()
    }
}
