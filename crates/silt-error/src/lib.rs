//! Error types shared across the silt workspace.
//!
//! Policy: lock and buffer operations never surface errors for ordinary
//! contention outcomes — an exhausted pool is `Ok(None)`, a pinned page is
//! `Ok(false)`. `SiltError` is reserved for disk I/O failures and broken
//! internal invariants, which always propagate.

use silt_types::PageId;
use thiserror::Error;

/// Primary error type for silt storage-engine operations.
#[derive(Error, Debug)]
pub enum SiltError {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk I/O error during a page read.
    #[error("disk I/O error reading page {page_id}")]
    IoRead { page_id: PageId },

    /// Disk I/O error during a page write.
    #[error("disk I/O error writing page {page_id}")]
    IoWrite { page_id: PageId },

    /// Short read (fewer bytes than a full page).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// A caller handed a buffer whose length is not the page size.
    #[error("page buffer has length {actual}, expected {expected}")]
    BadPageBuffer { expected: usize, actual: usize },

    /// Internal invariant violation. Indicates a bug in the engine, not a
    /// recoverable condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SiltError {
    /// Construct an [`SiltError::Internal`] from any displayable message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, SiltError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SiltError::ShortRead {
            expected: 4096,
            actual: 100,
        };
        assert_eq!(err.to_string(), "short read: expected 4096 bytes, got 100");

        let err = SiltError::IoWrite {
            page_id: PageId::new(9),
        };
        assert_eq!(err.to_string(), "disk I/O error writing page 9");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: SiltError = io.into();
        assert!(matches!(err, SiltError::Io(_)));
    }
}
