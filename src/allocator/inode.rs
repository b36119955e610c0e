//! Segment inodes
//!
//! Inodes are 192-byte records packed into inode pages after a list node
//! that links the page into SEG_INODES_FREE or SEG_INODES_FULL:
//!
//! ```text
//! 0   segment id (u64, 0 = free inode)
//! 8   not_full_n_used: used pages in NOT_FULL extents
//! 12  FREE list base
//! 28  NOT_FULL list base
//! 44  FULL list base
//! 60  magic number
//! 64  fragment page array (32 x u32, FIL_NULL = empty slot)
//! ```
//!
//! A segment is found through its 10-byte segment header, stored by the
//! owner in some page of its own: space id, inode page number, inode offset.

use super::flst::{self, ListBase, FLST_NODE_SIZE};
use super::fsp;
use super::header::{SpaceHeader, SpaceList};
use super::{Space, FSEG_FRAG_LIMIT};
use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::{FilAddr, PageType, FIL_NULL, FIL_PAGE_DATA, FIL_PAGE_DATA_END};
use serde::{Deserialize, Serialize};

pub const FSEG_INODE_PAGE_NODE: usize = FIL_PAGE_DATA;
pub const FSEG_ARR_OFFSET: usize = FSEG_INODE_PAGE_NODE + FLST_NODE_SIZE;

const FSEG_ID: usize = 0;
const FSEG_NOT_FULL_N_USED: usize = 8;
const FSEG_FREE: usize = 12;
const FSEG_NOT_FULL: usize = 28;
const FSEG_FULL: usize = 44;
const FSEG_MAGIC_N: usize = 60;
const FSEG_FRAG_ARR: usize = 64;
const FSEG_FRAG_SLOT_SIZE: usize = 4;

pub const FSEG_INODE_SIZE: usize = FSEG_FRAG_ARR + FSEG_FRAG_LIMIT as usize * FSEG_FRAG_SLOT_SIZE;
pub const FSEG_MAGIC_N_VALUE: u32 = 97_937_874;

const FSEG_HDR_SPACE: usize = 0;
const FSEG_HDR_PAGE_NO: usize = 4;
const FSEG_HDR_OFFSET: usize = 8;

/// Size of a segment header
pub const FSEG_HEADER_SIZE: usize = 10;

/// Inodes that fit in one inode page
pub fn inodes_per_page(page_size: u32) -> u32 {
    ((page_size as usize - FSEG_ARR_OFFSET - FIL_PAGE_DATA_END - 2) / FSEG_INODE_SIZE) as u32
}

/// Location of a segment header: the public handle of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    pub page_no: u32,
    pub offset: u16,
}

impl SegmentRef {
    pub fn new(page_no: u32, offset: u16) -> Self {
        SegmentRef { page_no, offset }
    }
}

/// The three extent lists of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegList {
    /// Extents with no page used by the segment
    Free,
    NotFull,
    Full,
}

impl SegList {
    pub const ALL: [SegList; 3] = [SegList::Free, SegList::NotFull, SegList::Full];
}

/// Handle to one inode record latched by a mini-transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub block: Block,
    pub offset: usize,
}

impl Inode {
    pub fn nth(block: Block, n: u32) -> Self {
        Inode {
            block,
            offset: FSEG_ARR_OFFSET + n as usize * FSEG_INODE_SIZE,
        }
    }

    /// Address stored in segment headers
    pub fn addr(&self) -> FilAddr {
        FilAddr::new(self.block.page_no(), self.offset as u16)
    }

    pub fn dump<'m>(&self, mtr: &'m Mtr<'_>) -> &'m [u8] {
        mtr.read_bytes(self.block, self.offset, FSEG_INODE_SIZE)
    }

    pub fn id(&self, mtr: &Mtr<'_>) -> u64 {
        mtr.read_u64(self.block, self.offset + FSEG_ID)
    }

    pub fn not_full_n_used(&self, mtr: &Mtr<'_>) -> u32 {
        mtr.read_u32(self.block, self.offset + FSEG_NOT_FULL_N_USED)
    }

    pub fn set_not_full_n_used(&self, mtr: &mut Mtr<'_>, n_used: u32) -> Result<()> {
        mtr.write_u32(self.block, self.offset + FSEG_NOT_FULL_N_USED, n_used)
    }

    /// Adjust `not_full_n_used` by `delta`; going negative is corruption
    pub fn add_not_full_n_used(&self, mtr: &mut Mtr<'_>, delta: i64) -> Result<()> {
        let current = self.not_full_n_used(mtr) as i64;
        let updated = current + delta;
        if updated < 0 || updated > u32::MAX as i64 {
            return Err(corruption(
                self.block.page_no(),
                format!("not_full_n_used {} cannot change by {}", current, delta),
                self.dump(mtr),
            ));
        }
        self.set_not_full_n_used(mtr, updated as u32)
    }

    pub fn list(&self, list: SegList) -> ListBase {
        let field = match list {
            SegList::Free => FSEG_FREE,
            SegList::NotFull => FSEG_NOT_FULL,
            SegList::Full => FSEG_FULL,
        };
        ListBase::new(self.block, self.offset + field)
    }

    pub fn list_len(&self, mtr: &Mtr<'_>, list: SegList) -> u32 {
        flst::len(mtr, self.list(list))
    }

    pub fn check_magic(&self, mtr: &Mtr<'_>) -> Result<()> {
        let magic = mtr.read_u32(self.block, self.offset + FSEG_MAGIC_N);
        if magic != FSEG_MAGIC_N_VALUE {
            return Err(corruption(
                self.block.page_no(),
                format!("segment inode at offset {} has bad magic {}", self.offset, magic),
                self.dump(mtr),
            ));
        }
        Ok(())
    }

    fn slot_offset(&self, n: u32) -> usize {
        self.offset + FSEG_FRAG_ARR + n as usize * FSEG_FRAG_SLOT_SIZE
    }

    pub fn frag_page(&self, mtr: &Mtr<'_>, n: u32) -> Option<u32> {
        match mtr.read_u32(self.block, self.slot_offset(n)) {
            FIL_NULL => None,
            page_no => Some(page_no),
        }
    }

    pub fn set_frag_page(&self, mtr: &mut Mtr<'_>, n: u32, page_no: Option<u32>) -> Result<()> {
        mtr.write_u32(self.block, self.slot_offset(n), page_no.unwrap_or(FIL_NULL))
    }

    pub fn find_free_frag_slot(&self, mtr: &Mtr<'_>) -> Option<u32> {
        (0..FSEG_FRAG_LIMIT).find(|&n| self.frag_page(mtr, n).is_none())
    }

    pub fn find_last_used_frag_slot(&self, mtr: &Mtr<'_>) -> Option<u32> {
        (0..FSEG_FRAG_LIMIT)
            .rev()
            .find(|&n| self.frag_page(mtr, n).is_some())
    }

    /// Slot holding `page_no`
    pub fn find_frag_slot(&self, mtr: &Mtr<'_>, page_no: u32) -> Option<u32> {
        (0..FSEG_FRAG_LIMIT).find(|&n| self.frag_page(mtr, n) == Some(page_no))
    }

    pub fn frag_pages(&self, mtr: &Mtr<'_>) -> Vec<u32> {
        (0..FSEG_FRAG_LIMIT)
            .filter_map(|n| self.frag_page(mtr, n))
            .collect()
    }

    pub fn n_frag_pages(&self, mtr: &Mtr<'_>) -> u32 {
        self.frag_pages(mtr).len() as u32
    }

    /// Stamp a newly allocated inode for segment `id`
    pub fn init(&self, mtr: &mut Mtr<'_>, id: u64) -> Result<()> {
        mtr.write_u64(self.block, self.offset + FSEG_ID, id)?;
        self.set_not_full_n_used(mtr, 0)?;
        for list in SegList::ALL {
            flst::init(mtr, self.list(list))?;
        }
        mtr.write_u32(self.block, self.offset + FSEG_MAGIC_N, FSEG_MAGIC_N_VALUE)?;

        let empty = [0xFFu8; FSEG_FRAG_LIMIT as usize * FSEG_FRAG_SLOT_SIZE];
        mtr.write_bytes(self.block, self.offset + FSEG_FRAG_ARR, &empty)
    }

    fn clear(&self, mtr: &mut Mtr<'_>) -> Result<()> {
        mtr.write_u64(self.block, self.offset + FSEG_ID, 0)?;
        mtr.write_u32(self.block, self.offset + FSEG_MAGIC_N, 0)
    }
}

fn find_inode(mtr: &Mtr<'_>, block: Block, page_size: u32, from: u32, used: bool) -> Option<u32> {
    (from..inodes_per_page(page_size)).find(|&n| (Inode::nth(block, n).id(mtr) != 0) == used)
}

fn page_node(page_no: u32) -> FilAddr {
    FilAddr::new(page_no, FSEG_INODE_PAGE_NODE as u16)
}

/// Allocate a new inode page and put it on SEG_INODES_FREE
fn alloc_inode_page(mtr: &mut Mtr<'_>, space: &Space<'_>, header: &SpaceHeader) -> Result<bool> {
    let Some(block) = fsp::alloc_free_page(mtr, space, 0, PageType::Inode)? else {
        return Ok(false);
    };

    flst::add_last(
        mtr,
        header.list(SpaceList::SegInodesFree),
        page_node(block.page_no()),
    )?;
    tracing::debug!("Allocated inode page {}", block.page_no());
    Ok(true)
}

/// Find an unused inode, allocating a new inode page when none is free.
///
/// The returned inode still has id 0; the caller initializes it.
pub(crate) fn alloc_inode(mtr: &mut Mtr<'_>, space: &Space<'_>) -> Result<Option<Inode>> {
    let page_size = space.page_size();
    let header = SpaceHeader::get(mtr, page_size)?;
    let free_pages = header.list(SpaceList::SegInodesFree);

    if flst::len(mtr, free_pages) == 0 && !alloc_inode_page(mtr, space, &header)? {
        return Ok(None);
    }

    let page_no = flst::first(mtr, free_pages).page_no;
    let block = mtr.fetch(page_no)?;
    if mtr.page(block).page_type() != Some(PageType::Inode) {
        return Err(corruption(
            page_no,
            "page on SEG_INODES_FREE is not an inode page",
            header.dump(mtr),
        ));
    }

    let Some(n) = find_inode(mtr, block, page_size, 0, false) else {
        return Err(corruption(
            page_no,
            "inode page on SEG_INODES_FREE has no free inode",
            header.dump(mtr),
        ));
    };

    if find_inode(mtr, block, page_size, n + 1, false).is_none() {
        // This was the last free inode of the page
        flst::remove(mtr, free_pages, page_node(page_no))?;
        flst::add_last(mtr, header.list(SpaceList::SegInodesFull), page_node(page_no))?;
    }

    Ok(Some(Inode::nth(block, n)))
}

/// Release an inode, freeing its page once no inode on it is in use
pub(crate) fn free_inode(mtr: &mut Mtr<'_>, space: &Space<'_>, inode: &Inode) -> Result<()> {
    let page_size = space.page_size();
    let header = SpaceHeader::get(mtr, page_size)?;
    let page_no = inode.block.page_no();

    if find_inode(mtr, inode.block, page_size, 0, false).is_none() {
        // Page was full; it gains a free inode now
        flst::remove(mtr, header.list(SpaceList::SegInodesFull), page_node(page_no))?;
        flst::add_last(mtr, header.list(SpaceList::SegInodesFree), page_node(page_no))?;
    }

    inode.clear(mtr)?;

    if find_inode(mtr, inode.block, page_size, 0, true).is_none() {
        flst::remove(mtr, header.list(SpaceList::SegInodesFree), page_node(page_no))?;
        fsp::free_page(mtr, space, page_no)?;
        tracing::debug!("Freed inode page {}", page_no);
    }
    Ok(())
}

/// Used inodes on an inode page
pub(crate) fn used_inodes(mtr: &Mtr<'_>, block: Block, page_size: u32) -> Vec<Inode> {
    (0..inodes_per_page(page_size))
        .map(|n| Inode::nth(block, n))
        .filter(|inode| inode.id(mtr) != 0)
        .collect()
}

/// Has at least one unused inode
pub(crate) fn has_free_inode(mtr: &Mtr<'_>, block: Block, page_size: u32) -> bool {
    find_inode(mtr, block, page_size, 0, false).is_some()
}

/// Write a segment header pointing at `inode`
pub(crate) fn write_segment_header(
    mtr: &mut Mtr<'_>,
    block: Block,
    offset: usize,
    space_id: u32,
    inode: &Inode,
) -> Result<()> {
    let addr = inode.addr();
    mtr.write_u32(block, offset + FSEG_HDR_SPACE, space_id)?;
    mtr.write_u32(block, offset + FSEG_HDR_PAGE_NO, addr.page_no)?;
    mtr.write_u16(block, offset + FSEG_HDR_OFFSET, addr.boffset)
}

/// Inode of a segment, or `None` if it has already been freed
pub(crate) fn inode_try_get(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<Option<Inode>> {
    let block = mtr.fetch(segment.page_no)?;
    let offset = segment.offset as usize;

    let space_id = mtr.read_u32(block, offset + FSEG_HDR_SPACE);
    let page_no = mtr.read_u32(block, offset + FSEG_HDR_PAGE_NO);
    let boffset = mtr.read_u16(block, offset + FSEG_HDR_OFFSET) as usize;

    let per_page = inodes_per_page(space.page_size()) as usize;
    let well_formed = space_id == space.config.space_id
        && page_no != FIL_NULL
        && boffset >= FSEG_ARR_OFFSET
        && (boffset - FSEG_ARR_OFFSET) % FSEG_INODE_SIZE == 0
        && (boffset - FSEG_ARR_OFFSET) / FSEG_INODE_SIZE < per_page;
    if !well_formed {
        return Err(corruption(
            segment.page_no,
            format!("malformed segment header at offset {}", segment.offset),
            mtr.read_bytes(block, offset, FSEG_HEADER_SIZE),
        ));
    }

    let inode_block = mtr.fetch(page_no)?;
    let inode = Inode::nth(inode_block, ((boffset - FSEG_ARR_OFFSET) / FSEG_INODE_SIZE) as u32);
    if inode.id(mtr) == 0 {
        return Ok(None);
    }
    inode.check_magic(mtr)?;
    Ok(Some(inode))
}

/// Inode of a live segment
pub(crate) fn inode_get(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<Inode> {
    match inode_try_get(mtr, space, segment)? {
        Some(inode) => Ok(inode),
        None => Err(corruption(
            segment.page_no,
            "segment header points at a free inode",
            &segment.offset.to_be_bytes(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::Fixture;
    use crate::config::{CorruptionPolicy, SpaceConfig};

    fn fixture() -> Fixture {
        Fixture::initialized(SpaceConfig {
            page_size: 4096,
            initial_size: 256,
            autoextend: false,
            on_corruption: CorruptionPolicy::Propagate,
            ..Default::default()
        })
    }

    #[test]
    fn test_inode_size_and_capacity() {
        assert_eq!(FSEG_INODE_SIZE, 192);
        assert_eq!(inodes_per_page(16384), 85);
        assert_eq!(inodes_per_page(4096), 21);
    }

    #[test]
    fn test_alloc_inode_creates_page() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();

        let inode = alloc_inode(&mut mtr, &space).unwrap().unwrap();
        assert_eq!(inode.block.page_no(), 2);
        assert_eq!(inode.offset, FSEG_ARR_OFFSET);
        assert_eq!(mtr.page(inode.block).page_type(), Some(PageType::Inode));

        inode.init(&mut mtr, 5).unwrap();
        inode.check_magic(&mtr).unwrap();
        assert_eq!(inode.id(&mtr), 5);
        assert_eq!(inode.find_free_frag_slot(&mtr), Some(0));
        assert_eq!(inode.find_last_used_frag_slot(&mtr), None);

        // Second inode comes from the same page
        let second = alloc_inode(&mut mtr, &space).unwrap().unwrap();
        assert_eq!(second.block, inode.block);
        assert_eq!(second.offset, FSEG_ARR_OFFSET + FSEG_INODE_SIZE);
    }

    #[test]
    fn test_full_inode_page_moves_lists() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();

        let mut inodes = Vec::new();
        for id in 1..=inodes_per_page(4096) as u64 {
            let inode = alloc_inode(&mut mtr, &space).unwrap().unwrap();
            inode.init(&mut mtr, id).unwrap();
            inodes.push(inode);
        }

        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFull), 1);
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFree), 0);

        free_inode(&mut mtr, &space, &inodes[3]).unwrap();
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFull), 0);
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFree), 1);

        // The freed slot is reused first
        let reused = alloc_inode(&mut mtr, &space).unwrap().unwrap();
        assert_eq!(reused, inodes[3]);
    }

    #[test]
    fn test_last_inode_frees_page() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();

        let inode = alloc_inode(&mut mtr, &space).unwrap().unwrap();
        inode.init(&mut mtr, 1).unwrap();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.frag_n_used(&mtr), 3);

        free_inode(&mut mtr, &space, &inode).unwrap();
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFree), 0);
        assert_eq!(header.frag_n_used(&mtr), 2);
    }

    #[test]
    fn test_segment_header_lookup() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();

        let inode = alloc_inode(&mut mtr, &space).unwrap().unwrap();
        inode.init(&mut mtr, 1).unwrap();

        let owner = fsp::alloc_free_page(&mut mtr, &space, 0, PageType::Sys)
            .unwrap()
            .unwrap();
        write_segment_header(&mut mtr, owner, 100, fx.config.space_id, &inode).unwrap();

        let segment = SegmentRef::new(owner.page_no(), 100);
        assert_eq!(inode_get(&mut mtr, &space, segment).unwrap(), inode);

        free_inode(&mut mtr, &space, &inode).unwrap();
        assert_eq!(inode_try_get(&mut mtr, &space, segment).unwrap(), None);
        assert!(inode_get(&mut mtr, &space, segment)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_malformed_segment_header() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();

        let owner = fsp::alloc_free_page(&mut mtr, &space, 0, PageType::Sys)
            .unwrap()
            .unwrap();
        mtr.write_u32(owner, 100, 999).unwrap();

        let segment = SegmentRef::new(owner.page_no(), 100);
        assert!(inode_try_get(&mut mtr, &space, segment)
            .unwrap_err()
            .is_corruption());
    }
}
