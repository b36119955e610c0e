//! Tablespace header
//!
//! Stored at offset 38 of page 0:
//!
//! ```text
//! 0   space id
//! 4   (unused)
//! 8   size in pages
//! 12  free limit: pages below it have initialized descriptors
//! 16  flags (page size, space kind)
//! 20  frag_n_used: used pages in FREE_FRAG extents
//! 24  FREE list base
//! 40  FREE_FRAG list base
//! 56  FULL_FRAG list base
//! 72  next segment id (u64)
//! 80  SEG_INODES_FULL list base
//! 96  SEG_INODES_FREE list base
//! ```

use super::flst::{self, ListBase};
use crate::config::SpaceKind;
use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::{read_u32, read_u64, FIL_PAGE_DATA};
use serde::Serialize;

pub const FSP_HEADER_OFFSET: usize = FIL_PAGE_DATA;
pub const FSP_HEADER_SIZE: usize = 112;

const FSP_SPACE_ID: usize = 0;
const FSP_NOT_USED: usize = 4;
const FSP_SIZE: usize = 8;
const FSP_FREE_LIMIT: usize = 12;
const FSP_SPACE_FLAGS: usize = 16;
const FSP_FRAG_N_USED: usize = 20;
const FSP_FREE: usize = 24;
const FSP_FREE_FRAG: usize = 40;
const FSP_FULL_FRAG: usize = 56;
const FSP_SEG_ID: usize = 72;
const FSP_SEG_INODES_FULL: usize = 80;
const FSP_SEG_INODES_FREE: usize = 96;

const FLAGS_POS_PAGE_SSIZE: u32 = 6;
const FLAGS_MASK_PAGE_SSIZE: u32 = 0xF;
const FLAGS_POS_KIND: u32 = 12;
const FLAGS_MASK_KIND: u32 = 0x3;

/// The five lists anchored in the tablespace header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpaceList {
    /// Wholly free extents
    Free,
    /// Extents with some fragment pages used
    FreeFrag,
    /// Extents with every page used as a fragment page
    FullFrag,
    /// Inode pages without a free inode
    SegInodesFull,
    /// Inode pages with at least one free inode
    SegInodesFree,
}

impl SpaceList {
    pub const ALL: [SpaceList; 5] = [
        SpaceList::Free,
        SpaceList::FreeFrag,
        SpaceList::FullFrag,
        SpaceList::SegInodesFull,
        SpaceList::SegInodesFree,
    ];

    fn offset(self) -> usize {
        FSP_HEADER_OFFSET
            + match self {
                SpaceList::Free => FSP_FREE,
                SpaceList::FreeFrag => FSP_FREE_FRAG,
                SpaceList::FullFrag => FSP_FULL_FRAG,
                SpaceList::SegInodesFull => FSP_SEG_INODES_FULL,
                SpaceList::SegInodesFree => FSP_SEG_INODES_FREE,
            }
    }

    /// Lists whose nodes are extent descriptors
    pub fn holds_extents(self) -> bool {
        matches!(
            self,
            SpaceList::Free | SpaceList::FreeFrag | SpaceList::FullFrag
        )
    }
}

/// Encode the page size and space kind into header flags
pub fn encode_flags(page_size: u32, kind: SpaceKind) -> u32 {
    let ssize = page_size.trailing_zeros() - 9;
    let kind = match kind {
        SpaceKind::General => 0,
        SpaceKind::Undo => 1,
        SpaceKind::Temporary => 2,
    };
    (ssize << FLAGS_POS_PAGE_SSIZE) | (kind << FLAGS_POS_KIND)
}

/// Page size recorded in header flags
pub fn page_size_from_flags(flags: u32) -> Option<u32> {
    let ssize = (flags >> FLAGS_POS_PAGE_SSIZE) & FLAGS_MASK_PAGE_SSIZE;
    if ssize == 0 {
        return None;
    }
    Some(1u32 << (ssize + 9))
}

pub fn kind_from_flags(flags: u32) -> Option<SpaceKind> {
    match (flags >> FLAGS_POS_KIND) & FLAGS_MASK_KIND {
        0 => Some(SpaceKind::General),
        1 => Some(SpaceKind::Undo),
        2 => Some(SpaceKind::Temporary),
        _ => None,
    }
}

/// Handle to the header on page 0, latched by a mini-transaction
#[derive(Debug, Clone, Copy)]
pub struct SpaceHeader {
    block: Block,
    page_size: u32,
}

impl SpaceHeader {
    /// Latch page 0
    pub fn get(mtr: &mut Mtr<'_>, page_size: u32) -> Result<Self> {
        Ok(SpaceHeader {
            block: mtr.fetch(0)?,
            page_size,
        })
    }

    /// Write a fresh header into an already created page 0
    pub fn init(
        mtr: &mut Mtr<'_>,
        block: Block,
        space_id: u32,
        size: u32,
        flags: u32,
        page_size: u32,
    ) -> Result<Self> {
        let header = SpaceHeader { block, page_size };

        mtr.write_bytes(block, FSP_HEADER_OFFSET, &[0u8; FSP_HEADER_SIZE])?;
        header.write(mtr, FSP_SPACE_ID, space_id)?;
        header.write(mtr, FSP_NOT_USED, 0)?;
        header.write(mtr, FSP_SIZE, size)?;
        header.write(mtr, FSP_FREE_LIMIT, 0)?;
        header.write(mtr, FSP_SPACE_FLAGS, flags)?;
        header.write(mtr, FSP_FRAG_N_USED, 0)?;

        for list in SpaceList::ALL {
            flst::init(mtr, header.list(list))?;
        }
        mtr.write_u64(block, FSP_HEADER_OFFSET + FSP_SEG_ID, 1)?;

        Ok(header)
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&self, mtr: &Mtr<'_>, field: usize) -> u32 {
        mtr.read_u32(self.block, FSP_HEADER_OFFSET + field)
    }

    fn write(&self, mtr: &mut Mtr<'_>, field: usize, value: u32) -> Result<()> {
        mtr.write_u32(self.block, FSP_HEADER_OFFSET + field, value)
    }

    pub fn space_id(&self, mtr: &Mtr<'_>) -> u32 {
        self.read(mtr, FSP_SPACE_ID)
    }

    pub fn size(&self, mtr: &Mtr<'_>) -> u32 {
        self.read(mtr, FSP_SIZE)
    }

    pub fn set_size(&self, mtr: &mut Mtr<'_>, size: u32) -> Result<()> {
        self.write(mtr, FSP_SIZE, size)
    }

    pub fn free_limit(&self, mtr: &Mtr<'_>) -> u32 {
        self.read(mtr, FSP_FREE_LIMIT)
    }

    pub fn set_free_limit(&self, mtr: &mut Mtr<'_>, limit: u32) -> Result<()> {
        self.write(mtr, FSP_FREE_LIMIT, limit)
    }

    pub fn flags(&self, mtr: &Mtr<'_>) -> u32 {
        self.read(mtr, FSP_SPACE_FLAGS)
    }

    pub fn frag_n_used(&self, mtr: &Mtr<'_>) -> u32 {
        self.read(mtr, FSP_FRAG_N_USED)
    }

    pub fn set_frag_n_used(&self, mtr: &mut Mtr<'_>, n_used: u32) -> Result<()> {
        self.write(mtr, FSP_FRAG_N_USED, n_used)
    }

    /// Adjust `frag_n_used` by `delta`; going negative is corruption
    pub fn add_frag_n_used(&self, mtr: &mut Mtr<'_>, delta: i64) -> Result<()> {
        let current = self.frag_n_used(mtr) as i64;
        let updated = current + delta;
        if updated < 0 || updated > u32::MAX as i64 {
            return Err(corruption(
                0,
                format!("frag_n_used {} cannot change by {}", current, delta),
                self.dump(mtr),
            ));
        }
        self.set_frag_n_used(mtr, updated as u32)
    }

    pub fn list(&self, list: SpaceList) -> ListBase {
        ListBase::new(self.block, list.offset())
    }

    pub fn list_len(&self, mtr: &Mtr<'_>, list: SpaceList) -> u32 {
        flst::len(mtr, self.list(list))
    }

    pub fn next_segment_id(&self, mtr: &Mtr<'_>) -> u64 {
        mtr.read_u64(self.block, FSP_HEADER_OFFSET + FSP_SEG_ID)
    }

    /// Hand out the next segment id; ids are never reused
    pub fn alloc_segment_id(&self, mtr: &mut Mtr<'_>) -> Result<u64> {
        let id = self.next_segment_id(mtr);
        mtr.write_u64(self.block, FSP_HEADER_OFFSET + FSP_SEG_ID, id + 1)?;
        Ok(id)
    }

    /// Raw header bytes for diagnostics
    pub fn dump<'m>(&self, mtr: &'m Mtr<'_>) -> &'m [u8] {
        mtr.read_bytes(self.block, FSP_HEADER_OFFSET, FSP_HEADER_SIZE)
    }

    pub fn info(&self, mtr: &Mtr<'_>) -> SpaceHeaderInfo {
        SpaceHeaderInfo::from_page_bytes(mtr.page(self.block).data())
    }
}

/// Point-in-time copy of the header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceHeaderInfo {
    pub space_id: u32,
    pub size: u32,
    pub free_limit: u32,
    pub flags: u32,
    pub page_size: Option<u32>,
    pub frag_n_used: u32,
    pub free_len: u32,
    pub free_frag_len: u32,
    pub full_frag_len: u32,
    pub seg_inodes_full_len: u32,
    pub seg_inodes_free_len: u32,
    pub next_segment_id: u64,
}

impl SpaceHeaderInfo {
    /// Decode from the raw bytes of page 0
    pub fn from_page_bytes(page: &[u8]) -> Self {
        let field = |offset: usize| read_u32(page, FSP_HEADER_OFFSET + offset);
        let flags = field(FSP_SPACE_FLAGS);

        SpaceHeaderInfo {
            space_id: field(FSP_SPACE_ID),
            size: field(FSP_SIZE),
            free_limit: field(FSP_FREE_LIMIT),
            flags,
            page_size: page_size_from_flags(flags),
            frag_n_used: field(FSP_FRAG_N_USED),
            free_len: field(FSP_FREE),
            free_frag_len: field(FSP_FREE_FRAG),
            full_frag_len: field(FSP_FULL_FRAG),
            seg_inodes_full_len: field(FSP_SEG_INODES_FULL),
            seg_inodes_free_len: field(FSP_SEG_INODES_FREE),
            next_segment_id: read_u64(page, FSP_HEADER_OFFSET + FSP_SEG_ID),
        }
    }

    /// Every descriptor below the free limit exists, except that a
    /// tablespace smaller than one extent still has its first extent
    /// initialized
    pub fn limits_consistent(&self) -> bool {
        self.free_limit <= self.size || self.size < crate::page::EXTENT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::Fixture;
    use crate::io::Storage;
    use crate::page::PageType;

    #[test]
    fn test_flags_round_trip() {
        for page_size in [4096u32, 8192, 16384, 32768, 65536] {
            let flags = encode_flags(page_size, SpaceKind::Undo);
            assert_eq!(page_size_from_flags(flags), Some(page_size));
            assert_eq!(kind_from_flags(flags), Some(SpaceKind::Undo));
        }
        assert_eq!(page_size_from_flags(0), None);
    }

    #[test]
    fn test_init_and_snapshot() {
        let fx = Fixture::small(64);
        fx.storage.extend(64).unwrap();

        let mut mtr = fx.mtr();
        let block = mtr.create_page(0, PageType::FspHdr).unwrap();
        let flags = encode_flags(4096, SpaceKind::General);
        let header = SpaceHeader::init(&mut mtr, block, 9, 64, flags, 4096).unwrap();

        assert_eq!(header.space_id(&mtr), 9);
        assert_eq!(header.size(&mtr), 64);
        assert_eq!(header.next_segment_id(&mtr), 1);
        assert_eq!(header.alloc_segment_id(&mut mtr).unwrap(), 1);
        assert_eq!(header.alloc_segment_id(&mut mtr).unwrap(), 2);

        header.add_frag_n_used(&mut mtr, 5).unwrap();
        header.add_frag_n_used(&mut mtr, -2).unwrap();
        assert!(header.add_frag_n_used(&mut mtr, -4).is_err());

        let info = header.info(&mtr);
        assert_eq!(info.space_id, 9);
        assert_eq!(info.page_size, Some(4096));
        assert_eq!(info.frag_n_used, 3);
        assert_eq!(info.free_len, 0);
        assert_eq!(info.next_segment_id, 3);
    }
}
