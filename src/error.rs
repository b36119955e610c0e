//! Error types for tablespace operations
//!
//! Running out of space is not an error in this crate: allocation calls return
//! `Ok(None)` (or `false`) for that. Everything in [`SpaceError`] is either an
//! environmental failure (I/O, bad configuration) or a sign that the on-disk
//! structures are corrupt.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpaceError {
    /// On-disk allocator structures are inconsistent
    #[error("Tablespace corruption at page {page_no}: {detail}")]
    Corruption { page_no: u32, detail: String },

    #[error("Page checksum verification failed for page {page_no}")]
    ChecksumMismatch { page_no: u32 },

    #[error("Invalid page size: {0} (must be a power of two between 4096 and 65536)")]
    InvalidPageSize(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Page {page_no} is beyond the end of the tablespace ({size} pages)")]
    PageOutOfRange { page_no: u32, size: u32 },

    /// A mini-transaction asked for an exclusive latch on a page it already
    /// holds shared
    #[error("Page {page_no} is latched shared in this mini-transaction")]
    LatchConflict { page_no: u32 },

    #[error("Segment header at page {page_no} offset {offset} does not fit in the page body")]
    InvalidSegmentHeader { page_no: u32, offset: u16 },

    #[error("Tablespace id mismatch: expected {expected}, found {found}")]
    SpaceIdMismatch { expected: u32, found: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl SpaceError {
    /// True for errors that indicate damaged on-disk state
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SpaceError::Corruption { .. } | SpaceError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpaceError>;

/// Build a corruption error, logging the raw bytes of the offending record
pub(crate) fn corruption(page_no: u32, detail: impl Into<String>, dump: &[u8]) -> SpaceError {
    let detail = detail.into();
    tracing::error!(
        page_no,
        record = %hex::encode(dump),
        "Allocator corruption: {}",
        detail
    );
    SpaceError::Corruption { page_no, detail }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        let err = corruption(7, "bad state", &[0xde, 0xad]);
        assert!(err.is_corruption());
        assert!(SpaceError::ChecksumMismatch { page_no: 1 }.is_corruption());
        assert!(!SpaceError::InvalidPageSize(1000).is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = SpaceError::PageOutOfRange {
            page_no: 100,
            size: 64,
        };
        assert_eq!(
            err.to_string(),
            "Page 100 is beyond the end of the tablespace (64 pages)"
        );
    }
}
