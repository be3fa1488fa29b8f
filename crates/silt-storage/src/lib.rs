//! Disk manager: the page-granular I/O seam under the buffer pool.
//!
//! One trait, two backends:
//! - [`FileDiskManager`]: a single page file on disk.
//! - [`MemoryDiskManager`]: an in-memory page map for tests and ephemeral
//!   engines.
//!
//! Reads of never-written pages zero-fill the buffer, so a freshly
//! allocated page fetched before its first flush reads as all zeroes.

mod disk;
mod memory;

pub use disk::{DiskManager, FileDiskManager};
pub use memory::MemoryDiskManager;
