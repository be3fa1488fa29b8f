//! The [`DiskManager`] trait and the file-backed implementation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use silt_types::{PAGE_SIZE, PageId};
use tracing::debug;

/// Page-granular storage consumed by the buffer pool.
///
/// Implementations must tolerate reads of pages that were never written:
/// the buffer is zero-filled and the call succeeds. Page allocation is the
/// buffer pool's job; `deallocate_page` exists so backends can reclaim
/// extents, and is informational for backends that do not.
pub trait DiskManager: Send + Sync {
    /// Fill `buf` with the on-disk contents of `page_id`.
    ///
    /// `buf` must be exactly [`PAGE_SIZE`] bytes. Bytes beyond the end of
    /// the backing store read as zero.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Persist `buf` as the contents of `page_id`.
    ///
    /// `buf` must be exactly [`PAGE_SIZE`] bytes.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()>;

    /// Release the on-disk extent backing `page_id`.
    ///
    /// The page file backend keeps its extent (hole punching is not worth
    /// it for 4 KiB pages); the call still participates in the delete
    /// protocol so other backends can reclaim.
    fn deallocate_page(&self, page_id: PageId) -> Result<()>;
}

fn check_buf(buf: &[u8]) -> Result<()> {
    if buf.len() == PAGE_SIZE {
        Ok(())
    } else {
        Err(SiltError::BadPageBuffer {
            expected: PAGE_SIZE,
            actual: buf.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// FileDiskManager
// ---------------------------------------------------------------------------

/// Disk manager backed by a single page file.
///
/// Page `p` lives at byte offset `p * PAGE_SIZE`. All I/O goes through one
/// file handle under a mutex; the buffer pool serializes most calls anyway,
/// so per-call seek + read/write keeps this portable.
#[derive(Debug)]
pub struct FileDiskManager {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileDiskManager {
    /// Open (creating if absent) the page file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// The path of the backing page file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        check_buf(buf)?;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let offset = page_id.file_offset();

        if offset >= len {
            // Page beyond EOF: never written, reads as zeroes.
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0usize;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        // Partial trailing page: zero-fill the remainder.
        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        check_buf(buf)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset()))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        debug!(%page_id, "deallocate_page on page file is a no-op");
        Ok(())
    }
}
