//! Page cache for one tablespace
//!
//! Frames are handed out as `Arc<RwLock<Page>>`; mini-transactions latch them
//! and keep the guard for their whole lifetime. A frame is pinned while any
//! clone of its `Arc` exists outside the pool, and pinned frames are never
//! evicted. Eviction order is least-recently-used.
//!
//! Write-back follows the WAL rule: the redo log is flushed up to the page LSN
//! before the page image goes to storage.

use crate::error::{Result, SpaceError};
use crate::io::Storage;
use crate::page::Page;
use crate::redo::RedoLog;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Shared, latchable page frame
pub type FrameRef = Arc<RwLock<Page>>;

/// Buffer pool statistics
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BufferPoolStats {
    /// Fetches served from memory
    pub hits: u64,
    /// Fetches that had to read storage
    pub misses: u64,
    pub evictions: u64,
    /// Page images written to storage
    pub writes: u64,
    /// Frames currently cached
    pub resident: usize,
    pub capacity: usize,
}

impl BufferPoolStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct PoolInner {
    frames: LruCache<u32, FrameRef>,
    hits: u64,
    misses: u64,
    evictions: u64,
    writes: u64,
}

pub struct BufferPool {
    storage: Arc<dyn Storage>,
    redo: Arc<RedoLog>,
    page_size: u32,
    capacity: usize,
    verify_checksums: bool,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(
        storage: Arc<dyn Storage>,
        redo: Arc<RedoLog>,
        capacity: usize,
        verify_checksums: bool,
    ) -> Self {
        BufferPool {
            page_size: storage.page_size(),
            storage,
            redo,
            capacity,
            verify_checksums,
            inner: Mutex::new(PoolInner {
                frames: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
                writes: 0,
            }),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Get the frame of an existing page, reading it from storage on a miss
    pub fn fetch(&self, page_no: u32) -> Result<FrameRef> {
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get(&page_no) {
            let frame = frame.clone();
            inner.hits += 1;
            return Ok(frame);
        }

        inner.misses += 1;

        let mut bytes = vec![0u8; self.page_size as usize];
        self.storage.read_page(page_no, &mut bytes)?;
        let page = Page::from_bytes(bytes);

        if self.verify_checksums && !page.verify_checksum() {
            tracing::error!("Checksum mismatch reading page {}", page_no);
            return Err(SpaceError::ChecksumMismatch { page_no });
        }

        let frame = Arc::new(RwLock::new(page));
        inner.frames.put(page_no, frame.clone());
        self.evict_if_needed(&mut inner)?;

        Ok(frame)
    }

    /// Get a frame for a page that is about to be initialized.
    ///
    /// No storage read happens; an uncached page starts out zeroed.
    pub fn create(&self, page_no: u32) -> Result<FrameRef> {
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get(&page_no) {
            return Ok(frame.clone());
        }

        let frame = Arc::new(RwLock::new(Page::new(self.page_size)));
        inner.frames.put(page_no, frame.clone());
        self.evict_if_needed(&mut inner)?;

        Ok(frame)
    }

    pub fn is_cached(&self, page_no: u32) -> bool {
        self.inner.lock().frames.contains(&page_no)
    }

    /// Forget a frame without writing it back.
    ///
    /// The caller must hold the only latch on the page.
    pub(crate) fn discard(&self, page_no: u32) {
        if self.inner.lock().frames.pop(&page_no).is_some() {
            tracing::debug!("Discarded frame of page {}", page_no);
        }
    }

    fn write_back(&self, page_no: u32, page: &mut Page) -> Result<()> {
        self.redo.flush_to(page.lsn())?;
        page.stamp_checksum();
        self.storage.write_page(page_no, page.data())?;
        page.dirty = false;
        Ok(())
    }

    fn evict_if_needed(&self, inner: &mut PoolInner) -> Result<()> {
        while inner.frames.len() > self.capacity {
            // Oldest frame that nobody holds
            let victim = inner
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| Arc::strong_count(frame) == 1)
                .map(|(&page_no, _)| page_no);

            let Some(page_no) = victim else {
                // Everything is pinned; run over capacity until latches drop
                break;
            };

            if let Some(frame) = inner.frames.pop(&page_no) {
                let mut page = frame.write();
                if page.dirty {
                    self.write_back(page_no, &mut page)?;
                    inner.writes += 1;
                }
                inner.evictions += 1;
            }
        }
        Ok(())
    }

    /// Write every dirty page and sync storage
    pub fn flush_all(&self) -> Result<()> {
        let frames: Vec<(u32, FrameRef)> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .map(|(&page_no, frame)| (page_no, frame.clone()))
                .collect()
        };

        let mut written = 0;
        for (page_no, frame) in frames {
            let mut page = frame.write();
            if page.dirty {
                self.write_back(page_no, &mut page)?;
                written += 1;
            }
        }

        self.inner.lock().writes += written;
        self.storage.sync()?;
        tracing::debug!("Flushed {} dirty pages", written);
        Ok(())
    }

    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock();
        BufferPoolStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            writes: inner.writes,
            resident: inner.frames.len(),
            capacity: self.capacity,
        }
    }
}
