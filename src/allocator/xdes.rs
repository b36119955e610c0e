//! Extent descriptors
//!
//! Each extent of 64 pages is described by a 40-byte record in the
//! descriptor page of its group:
//!
//! ```text
//! 0   segment id (u64, 0 = unowned)
//! 8   list node (prev, next)
//! 20  state (u32)
//! 24  bitmap: 2 bits per page, bit 0 = free, bit 1 = clean
//! ```
//!
//! The state says which list the extent is on. Changes go through
//! [`Xdes::set_state`], which rejects any transition outside the table in
//! [`XdesState::can_transition_to`].

use super::header::{SpaceHeader, FSP_HEADER_OFFSET, FSP_HEADER_SIZE};
use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::{FilAddr, EXTENT_SIZE};
use serde::Serialize;

/// Offset of the descriptor array in a descriptor page
pub const XDES_ARR_OFFSET: usize = FSP_HEADER_OFFSET + FSP_HEADER_SIZE;
pub const XDES_SIZE: usize = 40;

const XDES_ID: usize = 0;
pub const XDES_FLST_NODE: usize = 8;
const XDES_STATE: usize = 20;
const XDES_BITMAP: usize = 24;
const XDES_BITMAP_SIZE: usize = (EXTENT_SIZE as usize * 2) / 8;

/// Extent descriptor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum XdesState {
    /// Descriptor page exists but the extent was never initialized
    NotInited = 0,
    /// On the tablespace FREE list
    Free = 1,
    /// On FREE_FRAG: some fragment pages used, some free
    FreeFrag = 2,
    /// On FULL_FRAG: all pages used as fragment pages
    FullFrag = 3,
    /// Owned by a segment
    Fseg = 4,
    /// Descriptor-group first extent leased to a segment
    FsegFrag = 5,
}

impl XdesState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(XdesState::NotInited),
            1 => Some(XdesState::Free),
            2 => Some(XdesState::FreeFrag),
            3 => Some(XdesState::FullFrag),
            4 => Some(XdesState::Fseg),
            5 => Some(XdesState::FsegFrag),
            _ => None,
        }
    }

    /// The legal state transitions
    pub fn can_transition_to(self, to: XdesState) -> bool {
        use XdesState::*;

        matches!(
            (self, to),
            (Free, Fseg)
                | (Free, FreeFrag)
                | (FreeFrag, FullFrag)
                | (FreeFrag, FsegFrag)
                | (FreeFrag, Free)
                | (FullFrag, FreeFrag)
                | (Fseg, Free)
                | (FsegFrag, FreeFrag)
                | (FsegFrag, FullFrag)
                | (FsegFrag, Free)
                | (NotInited, Free)
        )
    }

    /// Owned by a segment
    pub fn is_segment(self) -> bool {
        matches!(self, XdesState::Fseg | XdesState::FsegFrag)
    }
}

/// Which of the two per-page bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitKind {
    Free = 0,
    Clean = 1,
}

/// Handle to one descriptor record latched by a mini-transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xdes {
    pub block: Block,
    pub offset: usize,
    /// First page of the described extent
    pub first_page: u32,
}

impl Xdes {
    /// Descriptor of the extent containing `page_no`, or `None` when the
    /// page lies beyond the tablespace size or the free limit
    pub fn lookup(mtr: &mut Mtr<'_>, header: &SpaceHeader, page_no: u32) -> Result<Option<Xdes>> {
        let size = header.size(mtr);
        let free_limit = header.free_limit(mtr);
        if page_no >= size || page_no >= free_limit {
            return Ok(None);
        }
        Self::locate(mtr, header, page_no).map(Some)
    }

    /// Descriptor of the extent containing `page_no`, without range checks
    pub fn locate(mtr: &mut Mtr<'_>, header: &SpaceHeader, page_no: u32) -> Result<Xdes> {
        let page_size = header.page_size();
        let descr_page = page_no - page_no % page_size;
        let block = if descr_page == 0 {
            header.block()
        } else {
            mtr.fetch(descr_page)?
        };

        let index = ((page_no % page_size) / EXTENT_SIZE) as usize;
        Ok(Xdes {
            block,
            offset: XDES_ARR_OFFSET + index * XDES_SIZE,
            first_page: page_no - page_no % EXTENT_SIZE,
        })
    }

    /// Descriptor whose list node is at `node`
    pub fn from_node(mtr: &mut Mtr<'_>, page_size: u32, node: FilAddr) -> Result<Xdes> {
        let boffset = node.boffset as usize;
        let n_extents = (page_size / EXTENT_SIZE) as usize;

        let valid = node.page_no % page_size == 0
            && boffset >= XDES_ARR_OFFSET + XDES_FLST_NODE
            && (boffset - XDES_ARR_OFFSET - XDES_FLST_NODE) % XDES_SIZE == 0
            && (boffset - XDES_ARR_OFFSET - XDES_FLST_NODE) / XDES_SIZE < n_extents;
        if !valid {
            return Err(corruption(
                node.page_no,
                format!(
                    "list node {}:{} is not an extent descriptor",
                    node.page_no, node.boffset
                ),
                &node.to_bytes(),
            ));
        }

        let offset = boffset - XDES_FLST_NODE;
        let index = (offset - XDES_ARR_OFFSET) / XDES_SIZE;
        let block = mtr.fetch(node.page_no)?;
        Ok(Xdes {
            block,
            offset,
            first_page: node.page_no + index as u32 * EXTENT_SIZE,
        })
    }

    /// Address of the list node, as linked from list bases
    pub fn node(&self) -> FilAddr {
        FilAddr::new(self.block.page_no(), (self.offset + XDES_FLST_NODE) as u16)
    }

    /// Raw record bytes for diagnostics
    pub fn dump<'m>(&self, mtr: &'m Mtr<'_>) -> &'m [u8] {
        mtr.read_bytes(self.block, self.offset, XDES_SIZE)
    }

    fn check_offset(&self, mtr: &Mtr<'_>, page_off: u32) -> Result<()> {
        if page_off >= EXTENT_SIZE {
            return Err(corruption(
                self.first_page,
                format!("page offset {} outside the extent", page_off),
                self.dump(mtr),
            ));
        }
        Ok(())
    }

    pub fn get_bit(&self, mtr: &Mtr<'_>, kind: BitKind, page_off: u32) -> bool {
        let index = page_off as usize * 2 + kind as usize;
        let byte = mtr.read_u8(self.block, self.offset + XDES_BITMAP + index / 8);
        (byte >> (index % 8)) & 1 == 1
    }

    pub fn set_bit(
        &self,
        mtr: &mut Mtr<'_>,
        kind: BitKind,
        page_off: u32,
        value: bool,
    ) -> Result<()> {
        self.check_offset(mtr, page_off)?;

        let index = page_off as usize * 2 + kind as usize;
        let pos = self.offset + XDES_BITMAP + index / 8;
        let byte = mtr.read_u8(self.block, pos);
        let mask = 1u8 << (index % 8);
        let byte = if value { byte | mask } else { byte & !mask };
        mtr.write_u8(self.block, pos, byte)
    }

    /// First page offset, scanning from `hint` and wrapping around, whose bit
    /// of `kind` equals `value`
    pub fn find_bit(&self, mtr: &Mtr<'_>, kind: BitKind, value: bool, hint: u32) -> Option<u32> {
        let hint = hint % EXTENT_SIZE;
        (hint..EXTENT_SIZE)
            .chain(0..hint)
            .find(|&page_off| self.get_bit(mtr, kind, page_off) == value)
    }

    /// Pages of the extent in use
    pub fn n_used(&self, mtr: &Mtr<'_>) -> u32 {
        (0..EXTENT_SIZE)
            .filter(|&page_off| !self.get_bit(mtr, BitKind::Free, page_off))
            .count() as u32
    }

    pub fn is_free(&self, mtr: &Mtr<'_>) -> bool {
        self.n_used(mtr) == 0
    }

    pub fn is_full(&self, mtr: &Mtr<'_>) -> bool {
        self.n_used(mtr) == EXTENT_SIZE
    }

    pub fn state(&self, mtr: &Mtr<'_>) -> Result<XdesState> {
        let raw = mtr.read_u32(self.block, self.offset + XDES_STATE);
        XdesState::from_u32(raw).ok_or_else(|| {
            corruption(
                self.first_page,
                format!("unknown extent state {}", raw),
                self.dump(mtr),
            )
        })
    }

    pub fn set_state(&self, mtr: &mut Mtr<'_>, to: XdesState) -> Result<()> {
        let from = self.state(mtr)?;
        if !from.can_transition_to(to) {
            return Err(corruption(
                self.first_page,
                format!("illegal extent state transition {:?} -> {:?}", from, to),
                self.dump(mtr),
            ));
        }
        mtr.write_u32(self.block, self.offset + XDES_STATE, to as u32)
    }

    pub fn segment_id(&self, mtr: &Mtr<'_>) -> u64 {
        mtr.read_u64(self.block, self.offset + XDES_ID)
    }

    pub fn set_segment_id_and_state(
        &self,
        mtr: &mut Mtr<'_>,
        segment_id: u64,
        state: XdesState,
    ) -> Result<()> {
        mtr.write_u64(self.block, self.offset + XDES_ID, segment_id)?;
        self.set_state(mtr, state)
    }

    /// Owned by segment `segment_id` (as FSEG or a leased FSEG_FRAG extent)
    pub fn in_segment(&self, mtr: &Mtr<'_>, segment_id: u64) -> Result<bool> {
        Ok(self.state(mtr)?.is_segment() && self.segment_id(mtr) == segment_id)
    }

    /// Pages the descriptor group itself occupies in this extent: 2 for the
    /// first extent of a group, 0 otherwise
    pub fn overhead(&self, page_size: u32) -> u32 {
        if self.first_page % page_size == 0 {
            super::XDES_FRAG_N_USED
        } else {
            0
        }
    }

    /// Descriptor-group first extent whose only used pages are the
    /// descriptor and bitmap pages
    pub fn is_leasable(&self, mtr: &Mtr<'_>, page_size: u32) -> Result<bool> {
        if self.first_page % page_size != 0 || self.state(mtr)? != XdesState::FreeFrag {
            return Ok(false);
        }
        Ok(self.n_used(mtr) == super::XDES_FRAG_N_USED
            && !self.get_bit(mtr, BitKind::Free, 0)
            && !self.get_bit(mtr, BitKind::Free, super::FSP_IBUF_BITMAP_OFFSET))
    }

    /// No page is used on behalf of the owning segment: the extent is free,
    /// or it is a leased extent holding only its descriptor overhead
    pub fn is_unused_by_segment(&self, mtr: &Mtr<'_>) -> Result<bool> {
        let n_used = self.n_used(mtr);
        Ok(match self.state(mtr)? {
            XdesState::FsegFrag => n_used == super::XDES_FRAG_N_USED,
            _ => n_used == 0,
        })
    }

    /// Reset to a free extent: every page free and clean, no owner
    pub fn init(&self, mtr: &mut Mtr<'_>) -> Result<()> {
        mtr.write_bytes(
            self.block,
            self.offset + XDES_BITMAP,
            &[0xFF; XDES_BITMAP_SIZE],
        )?;
        mtr.write_u64(self.block, self.offset + XDES_ID, 0)?;
        self.set_state(mtr, XdesState::Free)
    }
}
