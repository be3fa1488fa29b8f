//! Buffer management: a bounded frame array caching disk pages.
//!
//! Two pieces:
//! - [`LruReplacer`]: O(1) least-recently-unpinned victim selection over
//!   frame ids.
//! - [`BufferPoolManager`]: page table + free list + replacer + disk
//!   manager, arbitrating page residency under one pool latch.
//!
//! # Frame residency invariants
//!
//! - A frame id is in exactly one of: the free list, the replacer, or
//!   pinned (`pin_count > 0`).
//! - A resident page id maps to exactly one frame, and that frame's
//!   metadata points back at it.
//! - A dirty frame's bytes are written to disk before the frame is reused
//!   for another page.

mod buffer_pool;
mod frame;
mod replacer;

pub use buffer_pool::BufferPoolManager;
pub use frame::{Frame, PageHandle};
pub use replacer::LruReplacer;
