//! Mini-transactions
//!
//! A mini-transaction (MTR) is the unit of atomic, crash-recoverable change.
//! It latches every page it touches and keeps the latch until commit, records
//! one redo record per write, and on commit appends all records to the redo
//! log as a single batch, stamps the batch LSN on each modified page, and
//! releases everything at once. An MTR dropped without commit restores the
//! pages it changed, so cached frames only ever show committed state.
//!
//! Pages are addressed through [`Block`] handles, which index the MTR's latch
//! memo. A handle is only meaningful inside the MTR that returned it.
//!
//! Structural allocator changes additionally hold the tablespace latch
//! ([`Mtr::x_lock_space`]) from the first change until commit. Read-only
//! walks take it shared ([`Mtr::s_lock_space`]). [`Mtr::fetch`] latches pages
//! in the mode that matches the tablespace latch.

use crate::buffer_pool::BufferPool;
use crate::error::{Result, SpaceError};
use crate::page::{read_u16, read_u32, read_u64, FilAddr, Page, PageType};
use crate::redo::{RedoLog, RedoRecord};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Every write produces a redo record
    Redo,
    /// Pages that are never durable (temporary tablespaces)
    NoRedo,
}

/// Handle to a page latched by a mini-transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    slot: usize,
    page_no: u32,
}

impl Block {
    pub fn page_no(&self) -> u32 {
        self.page_no
    }
}

// Guards are held only to be dropped at commit
#[allow(dead_code)]
enum SpaceLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

enum PageLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, Page>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Page>),
}

/// How to take back an uncommitted change to a page
enum Undo {
    Clean,
    /// The page as it was before the first write
    Image(Page),
    /// The frame was created by this MTR and has no earlier image
    Discard,
}

struct MemoSlot {
    page_no: u32,
    latch: PageLatch,
    undo: Undo,
}

impl MemoSlot {
    fn page(&self) -> &Page {
        match &self.latch {
            PageLatch::Shared(guard) => guard,
            PageLatch::Exclusive(guard) => guard,
        }
    }

    fn is_modified(&self) -> bool {
        !matches!(self.undo, Undo::Clean)
    }

    /// Save the before-image ahead of the first write
    fn remember(&mut self) {
        if self.is_modified() {
            return;
        }
        if let PageLatch::Exclusive(guard) = &self.latch {
            self.undo = Undo::Image(Page::clone(guard));
        }
    }
}

pub struct Mtr<'a> {
    space_id: u32,
    pool: &'a BufferPool,
    redo: &'a RedoLog,
    space_latch: &'a Arc<RwLock<()>>,
    space_guard: Option<SpaceLatch>,
    log_mode: LogMode,
    memo: Vec<MemoSlot>,
    records: Vec<RedoRecord>,
    committed: bool,
}

impl<'a> Mtr<'a> {
    pub(crate) fn start(
        space_id: u32,
        pool: &'a BufferPool,
        redo: &'a RedoLog,
        space_latch: &'a Arc<RwLock<()>>,
        log_mode: LogMode,
    ) -> Self {
        Mtr {
            space_id,
            pool,
            redo,
            space_latch,
            space_guard: None,
            log_mode,
            memo: Vec::new(),
            records: Vec::new(),
            committed: false,
        }
    }

    pub fn log_mode(&self) -> LogMode {
        self.log_mode
    }

    /// Take the tablespace latch in exclusive mode until commit
    pub fn x_lock_space(&mut self) {
        if self.space_guard.is_none() {
            self.space_guard = Some(SpaceLatch::Exclusive(self.space_latch.write_arc()));
        }
    }

    /// Take the tablespace latch in shared mode until commit
    pub fn s_lock_space(&mut self) {
        if self.space_guard.is_none() {
            self.space_guard = Some(SpaceLatch::Shared(self.space_latch.read_arc()));
        }
    }

    pub fn holds_space_latch(&self) -> bool {
        self.space_guard.is_some()
    }

    /// Latch mode used by [`Mtr::fetch`]
    pub fn default_latch(&self) -> LatchMode {
        match self.space_guard {
            Some(SpaceLatch::Shared(_)) => LatchMode::Shared,
            _ => LatchMode::Exclusive,
        }
    }

    /// Latch a page in the mode implied by the tablespace latch: exclusive
    /// for modifying mini-transactions, shared for read-only ones
    pub fn fetch(&mut self, page_no: u32) -> Result<Block> {
        self.get_page(page_no, self.default_latch())
    }

    fn find_slot(&self, page_no: u32) -> Option<usize> {
        self.memo.iter().position(|slot| slot.page_no == page_no)
    }

    /// Latch an existing page.
    ///
    /// A page already latched by this MTR is returned as is; asking for an
    /// exclusive latch on a page held shared fails with `LatchConflict`.
    pub fn get_page(&mut self, page_no: u32, mode: LatchMode) -> Result<Block> {
        if let Some(slot) = self.find_slot(page_no) {
            if mode == LatchMode::Exclusive
                && matches!(self.memo[slot].latch, PageLatch::Shared(_))
            {
                return Err(SpaceError::LatchConflict { page_no });
            }
            return Ok(Block { slot, page_no });
        }

        let frame = self.pool.fetch(page_no)?;
        let latch = match mode {
            LatchMode::Shared => PageLatch::Shared(frame.read_arc()),
            LatchMode::Exclusive => PageLatch::Exclusive(frame.write_arc()),
        };

        self.memo.push(MemoSlot {
            page_no,
            latch,
            undo: Undo::Clean,
        });
        Ok(Block {
            slot: self.memo.len() - 1,
            page_no,
        })
    }

    /// Latch a page exclusively and initialize it (`init_file_page`)
    pub fn create_page(&mut self, page_no: u32, page_type: PageType) -> Result<Block> {
        let slot = match self.find_slot(page_no) {
            Some(slot) => {
                if matches!(self.memo[slot].latch, PageLatch::Shared(_)) {
                    return Err(SpaceError::LatchConflict { page_no });
                }
                slot
            }
            None => {
                let cached = self.pool.is_cached(page_no);
                let frame = self.pool.create(page_no)?;
                self.memo.push(MemoSlot {
                    page_no,
                    latch: PageLatch::Exclusive(frame.write_arc()),
                    undo: if cached { Undo::Clean } else { Undo::Discard },
                });
                self.memo.len() - 1
            }
        };

        let space_id = self.space_id;
        let entry = &mut self.memo[slot];
        entry.remember();
        if let PageLatch::Exclusive(guard) = &mut entry.latch {
            guard.init(page_no, space_id, page_type);
        }

        if self.log_mode == LogMode::Redo {
            self.records.push(RedoRecord::InitPage {
                page_no,
                page_type: page_type as u16,
            });
        }

        Ok(Block { slot, page_no })
    }

    pub fn page(&self, block: Block) -> &Page {
        self.memo[block.slot].page()
    }

    pub fn read_bytes(&self, block: Block, offset: usize, len: usize) -> &[u8] {
        &self.page(block).data()[offset..offset + len]
    }

    pub fn read_u8(&self, block: Block, offset: usize) -> u8 {
        self.page(block).data()[offset]
    }

    pub fn read_u16(&self, block: Block, offset: usize) -> u16 {
        read_u16(self.page(block).data(), offset)
    }

    pub fn read_u32(&self, block: Block, offset: usize) -> u32 {
        read_u32(self.page(block).data(), offset)
    }

    pub fn read_u64(&self, block: Block, offset: usize) -> u64 {
        read_u64(self.page(block).data(), offset)
    }

    pub fn read_addr(&self, block: Block, offset: usize) -> FilAddr {
        FilAddr::from_bytes(self.read_bytes(block, offset, FilAddr::SIZE))
    }

    /// The single write primitive: copy `bytes` into the page and log it
    pub fn write_bytes(&mut self, block: Block, offset: usize, bytes: &[u8]) -> Result<()> {
        let entry = &mut self.memo[block.slot];
        entry.remember();
        match &mut entry.latch {
            PageLatch::Exclusive(guard) => {
                guard.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            PageLatch::Shared(_) => {
                return Err(SpaceError::LatchConflict {
                    page_no: block.page_no,
                })
            }
        }

        if self.log_mode == LogMode::Redo {
            self.records.push(RedoRecord::Write {
                page_no: block.page_no,
                offset: offset as u16,
                bytes: bytes.to_vec(),
            });
        }
        Ok(())
    }

    pub fn write_u8(&mut self, block: Block, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(block, offset, &[value])
    }

    pub fn write_u16(&mut self, block: Block, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(block, offset, &value.to_be_bytes())
    }

    pub fn write_u32(&mut self, block: Block, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(block, offset, &value.to_be_bytes())
    }

    pub fn write_u64(&mut self, block: Block, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(block, offset, &value.to_be_bytes())
    }

    pub fn write_addr(&mut self, block: Block, offset: usize, addr: FilAddr) -> Result<()> {
        self.write_bytes(block, offset, &addr.to_bytes())
    }

    /// Number of redo records collected so far
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    pub fn is_modified(&self) -> bool {
        self.memo.iter().any(MemoSlot::is_modified)
    }

    /// Make all changes durable-in-order and release every latch.
    ///
    /// Returns the LSN stamped on the modified pages.
    pub fn commit(mut self) -> Result<u64> {
        let lsn = if self.records.is_empty() {
            self.redo.current_lsn()
        } else {
            self.redo.append(self.space_id, &self.records)?
        };

        for slot in self.memo.iter_mut().filter(|slot| slot.is_modified()) {
            if let PageLatch::Exclusive(guard) = &mut slot.latch {
                guard.set_lsn(lsn);
                guard.dirty = true;
            }
        }

        self.committed = true;
        self.release();
        Ok(lsn)
    }

    /// Put every modified page back the way it was before this MTR touched
    /// it. Created frames with no earlier image leave the pool.
    fn rollback(&mut self) {
        let pool = self.pool;
        for slot in self.memo.iter_mut().rev() {
            match std::mem::replace(&mut slot.undo, Undo::Clean) {
                Undo::Clean => {}
                Undo::Image(before) => {
                    if let PageLatch::Exclusive(guard) = &mut slot.latch {
                        **guard = before;
                    }
                }
                Undo::Discard => pool.discard(slot.page_no),
            }
        }
        self.records.clear();
    }

    fn release(&mut self) {
        // Release page latches newest first, then the tablespace latch
        while let Some(slot) = self.memo.pop() {
            drop(slot);
        }
        self.space_guard = None;
        self.records.clear();
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        if !self.committed && self.is_modified() {
            let n_pages = self.memo.iter().filter(|slot| slot.is_modified()).count();
            tracing::warn!(
                "Mini-transaction dropped without commit; rolling back {} pages",
                n_pages
            );
            self.rollback();
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryStorage, Storage};

    struct Fixture {
        pool: BufferPool,
        redo: Arc<RedoLog>,
        latch: Arc<RwLock<()>>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new(4096));
        storage.extend(8).unwrap();
        let redo = Arc::new(RedoLog::in_memory());
        Fixture {
            pool: BufferPool::new(storage, redo.clone(), 64, true),
            redo,
            latch: Arc::new(RwLock::new(())),
        }
    }

    impl Fixture {
        fn mtr(&self) -> Mtr<'_> {
            Mtr::start(1, &self.pool, &self.redo, &self.latch, LogMode::Redo)
        }
    }

    #[test]
    fn test_write_and_commit_stamps_lsn() {
        let fx = fixture();

        let mut mtr = fx.mtr();
        let block = mtr.create_page(3, PageType::Allocated).unwrap();
        mtr.write_u32(block, 100, 0xDEAD_BEEF).unwrap();
        assert_eq!(mtr.read_u32(block, 100), 0xDEAD_BEEF);
        assert_eq!(mtr.n_records(), 2);
        let lsn = mtr.commit().unwrap();

        let frame = fx.pool.fetch(3).unwrap();
        let page = frame.read();
        assert_eq!(page.lsn(), lsn);
        assert!(page.is_dirty());
        assert_eq!(read_u32(page.data(), 100), 0xDEAD_BEEF);
    }

    #[test]
    fn test_uncommitted_changes_are_rolled_back() {
        let fx = fixture();

        let mut mtr = fx.mtr();
        let block = mtr.create_page(3, PageType::Allocated).unwrap();
        mtr.write_u32(block, 100, 1).unwrap();
        let lsn = mtr.commit().unwrap();

        {
            let mut mtr = fx.mtr();
            let block = mtr.fetch(3).unwrap();
            mtr.write_u32(block, 100, 2).unwrap();
            mtr.write_u32(block, 200, 3).unwrap();
            mtr.create_page(3, PageType::Xdes).unwrap();
            assert_eq!(mtr.read_u32(block, 100), 0);
        }

        let frame = fx.pool.fetch(3).unwrap();
        let page = frame.read();
        assert_eq!(read_u32(page.data(), 100), 1);
        assert_eq!(read_u32(page.data(), 200), 0);
        assert_eq!(page.page_type(), Some(PageType::Allocated));
        assert_eq!(page.lsn(), lsn);
        assert!(page.is_dirty());
        assert_eq!(fx.redo.current_lsn(), lsn);
    }

    #[test]
    fn test_uncommitted_new_page_leaves_pool() {
        let fx = fixture();
        assert!(!fx.pool.is_cached(5));

        {
            let mut mtr = fx.mtr();
            let block = mtr.create_page(5, PageType::Inode).unwrap();
            mtr.write_u16(block, 60, 9).unwrap();
        }

        assert!(!fx.pool.is_cached(5));
        let frame = fx.pool.fetch(5).unwrap();
        assert_eq!(read_u16(frame.read().data(), 60), 0);
    }

    #[test]
    fn test_same_page_returns_same_block() {
        let fx = fixture();

        let mut mtr = fx.mtr();
        let a = mtr.get_page(2, LatchMode::Exclusive).unwrap();
        let b = mtr.get_page(2, LatchMode::Shared).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_latch_upgrade_rejected() {
        let fx = fixture();

        let mut mtr = fx.mtr();
        mtr.get_page(2, LatchMode::Shared).unwrap();
        assert!(matches!(
            mtr.get_page(2, LatchMode::Exclusive),
            Err(SpaceError::LatchConflict { page_no: 2 })
        ));
    }

    #[test]
    fn test_no_redo_mode_skips_log() {
        let fx = fixture();

        let mut mtr = Mtr::start(1, &fx.pool, &fx.redo, &fx.latch, LogMode::NoRedo);
        let block = mtr.create_page(1, PageType::Allocated).unwrap();
        mtr.write_u8(block, 200, 7).unwrap();
        assert_eq!(mtr.n_records(), 0);
        mtr.commit().unwrap();

        assert_eq!(fx.redo.current_lsn(), 0);
    }

    #[test]
    fn test_space_latch_released_on_commit() {
        let fx = fixture();

        let mut mtr = fx.mtr();
        mtr.x_lock_space();
        assert!(mtr.holds_space_latch());
        assert!(fx.latch.try_write().is_none());
        mtr.commit().unwrap();

        assert!(fx.latch.try_write().is_some());
    }

    #[test]
    fn test_shared_space_latch_fetches_shared() {
        let fx = fixture();

        let mut reader = fx.mtr();
        reader.s_lock_space();
        assert_eq!(reader.default_latch(), LatchMode::Shared);
        let block = reader.fetch(4).unwrap();
        assert!(matches!(
            reader.write_u8(block, 100, 1),
            Err(SpaceError::LatchConflict { page_no: 4 })
        ));

        // A second reader is not blocked
        let mut other = fx.mtr();
        other.s_lock_space();
        other.fetch(4).unwrap();
        other.commit().unwrap();
        reader.commit().unwrap();
    }
}
