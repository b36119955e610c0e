//! Segments
//!
//! A segment owns up to 32 fragment pages (recorded in inode slots) plus any
//! number of whole extents kept on its FREE, NOT_FULL and FULL lists. Small
//! segments live entirely in fragment pages; once a segment uses 32 pages it
//! grows by whole extents.
//!
//! Accounting: `used = not_full_n_used + 64 * len(FULL) + fragment pages`
//! and `reserved = 64 * (len(FREE) + len(NOT_FULL) + len(FULL)) + fragment
//! pages`. A leased extent counts its descriptor and bitmap pages in
//! `not_full_n_used` while it sits on NOT_FULL.

use super::flst;
use super::fsp;
use super::header::{SpaceHeader, SpaceList};
use super::inode::{self, Inode, SegList, SegmentRef, FSEG_HEADER_SIZE};
use super::reserve;
use super::strategy::{self, AllocRequest, AllocStrategy, Candidate};
use super::xdes::{BitKind, Xdes, XdesState};
use super::{
    extend, AllocType, Direction, Space, FSEG_FREE_LIST_LIMIT, FSEG_FREE_LIST_MAX_LEN,
    FSP_IBUF_BITMAP_OFFSET, XDES_FRAG_N_USED,
};
use crate::error::{corruption, Result, SpaceError};
use crate::mtr::Mtr;
use crate::page::{PageType, EXTENT_SIZE, FIL_PAGE_DATA, FIL_PAGE_DATA_END, FIL_PAGE_TYPE};
use serde::Serialize;

/// A page handed out to a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatedPage {
    pub page_no: u32,
    pub strategy: AllocStrategy,
}

/// Snapshot of a segment's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub id: u64,
    pub reserved: u32,
    pub used: u32,
    pub not_full_n_used: u32,
    pub frag_pages: Vec<u32>,
    /// First pages of the extents on each segment list
    pub free: Vec<u32>,
    pub not_full: Vec<u32>,
    pub full: Vec<u32>,
}

/// `(reserved, used)` page counts of a segment
pub(crate) fn n_reserved_pages_low(mtr: &Mtr<'_>, inode: &Inode) -> (u32, u32) {
    let n_frag = inode.n_frag_pages(mtr);
    let n_free = inode.list_len(mtr, SegList::Free);
    let n_not_full = inode.list_len(mtr, SegList::NotFull);
    let n_full = inode.list_len(mtr, SegList::Full);

    let used = inode.not_full_n_used(mtr) + EXTENT_SIZE * n_full + n_frag;
    let reserved = n_frag + EXTENT_SIZE * (n_free + n_not_full + n_full);
    (reserved, used)
}

/// Prefill a large segment's FREE list with up to
/// [`FSEG_FREE_LIST_MAX_LEN`] consecutive free extents starting at `hint`
pub(crate) fn fill_free_list(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    inode: &Inode,
    hint: u32,
) -> Result<()> {
    let (reserved, _) = n_reserved_pages_low(mtr, inode);
    if reserved < FSEG_FREE_LIST_LIMIT * EXTENT_SIZE || inode.list_len(mtr, SegList::Free) > 0 {
        return Ok(());
    }

    let header = SpaceHeader::get(mtr, space.page_size())?;
    let seg_id = inode.id(mtr);
    let mut hint = hint;

    for _ in 0..FSEG_FREE_LIST_MAX_LEN {
        match Xdes::lookup(mtr, &header, hint)? {
            Some(xdes) if xdes.state(mtr)? == XdesState::Free => {}
            _ => return Ok(()),
        }
        let Some(xdes) = fsp::alloc_free_extent(mtr, space, hint)? else {
            return Ok(());
        };
        xdes.set_segment_id_and_state(mtr, seg_id, XdesState::Fseg)?;
        flst::add_last(mtr, inode.list(SegList::Free), xdes.node())?;

        tracing::debug!("Segment {} prefilled extent {}", seg_id, xdes.first_page);
        hint += EXTENT_SIZE;
    }
    Ok(())
}

/// A descriptor-group first extent on FREE_FRAG that holds nothing but its
/// descriptor and bitmap pages
fn find_leasable_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
) -> Result<Option<Xdes>> {
    for node in flst::collect(mtr, header.list(SpaceList::FreeFrag))? {
        let xdes = Xdes::from_node(mtr, space.page_size(), node)?;
        if xdes.is_leasable(mtr, space.page_size())? {
            return Ok(Some(xdes));
        }
    }
    Ok(None)
}

/// Get an extent for the segment: the first on its FREE list, else a leased
/// descriptor-group extent, else a fresh extent from the tablespace.
///
/// The returned extent is on the segment's FREE list.
pub(crate) fn alloc_free_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    inode: &Inode,
) -> Result<Option<Xdes>> {
    let free = inode.list(SegList::Free);
    if let Some(xdes) = fsp::list_first_extent(mtr, space, free)? {
        return Ok(Some(xdes));
    }

    let header = SpaceHeader::get(mtr, space.page_size())?;
    let seg_id = inode.id(mtr);

    if let Some(xdes) = find_leasable_extent(mtr, space, &header)? {
        flst::remove(mtr, header.list(SpaceList::FreeFrag), xdes.node())?;
        xdes.set_segment_id_and_state(mtr, seg_id, XdesState::FsegFrag)?;
        header.add_frag_n_used(mtr, -(XDES_FRAG_N_USED as i64))?;
        flst::add_last(mtr, free, xdes.node())?;

        tracing::debug!("Segment {} leased extent {}", seg_id, xdes.first_page);
        return Ok(Some(xdes));
    }

    let Some(xdes) = fsp::alloc_free_extent(mtr, space, 0)? else {
        return Ok(None);
    };
    xdes.set_segment_id_and_state(mtr, seg_id, XdesState::Fseg)?;
    fill_free_list(mtr, space, inode, xdes.first_page + EXTENT_SIZE)?;
    flst::add_last(mtr, free, xdes.node())?;

    tracing::debug!("Segment {} claimed extent {}", seg_id, xdes.first_page);
    Ok(Some(xdes))
}

/// Mark a free page of a segment-owned extent used, moving the extent
/// between the segment lists as it fills
fn mark_page_used(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    inode: &Inode,
    xdes: &Xdes,
    page_no: u32,
) -> Result<()> {
    if xdes.is_unused_by_segment(mtr)? {
        flst::remove(mtr, inode.list(SegList::Free), xdes.node())?;
        flst::add_last(mtr, inode.list(SegList::NotFull), xdes.node())?;
        inode.add_not_full_n_used(mtr, xdes.overhead(space.page_size()) as i64)?;
    }

    let page_off = page_no % EXTENT_SIZE;
    if !xdes.get_bit(mtr, BitKind::Free, page_off) {
        return Err(corruption(
            page_no,
            "segment allocation picked a page that is already used",
            xdes.dump(mtr),
        ));
    }
    xdes.set_bit(mtr, BitKind::Free, page_off, false)?;
    inode.add_not_full_n_used(mtr, 1)?;

    if xdes.is_full(mtr) {
        flst::remove(mtr, inode.list(SegList::NotFull), xdes.node())?;
        flst::add_last(mtr, inode.list(SegList::Full), xdes.node())?;
        inode.add_not_full_n_used(mtr, -(EXTENT_SIZE as i64))?;
    }
    Ok(())
}

/// Allocate one page for the segment of `inode`, trying the strategies in
/// order. Returns `None` when the tablespace is out of space.
pub(crate) fn alloc_free_page_low(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    inode: &Inode,
    hint: u32,
    direction: Direction,
) -> Result<Option<AllocatedPage>> {
    let header = SpaceHeader::get(mtr, space.page_size())?;
    let seg_id = inode.id(mtr);
    let (reserved, used) = n_reserved_pages_low(mtr, inode);

    let (hint, hint_descr) = match Xdes::lookup(mtr, &header, hint)? {
        Some(xdes) => (hint, xdes),
        None => match Xdes::lookup(mtr, &header, 0)? {
            Some(xdes) => (0, xdes),
            None => {
                return Err(corruption(
                    0,
                    "first extent of the tablespace is not initialized",
                    header.dump(mtr),
                ))
            }
        },
    };

    let request = AllocRequest {
        inode: *inode,
        seg_id,
        hint,
        hint_descr,
        direction,
        reserved,
        used,
    };

    let Some((strategy, candidate)) = strategy::pick(mtr, space, &request)? else {
        tracing::debug!("Segment {} found no page to allocate", seg_id);
        return Ok(None);
    };

    let page_no = match candidate {
        Candidate::Fragment(block) => block.page_no(),
        Candidate::InExtent { page_no, xdes } => {
            if page_no >= header.size(mtr) {
                // Possible only for a leased first extent of a tiny tablespace
                if page_no >= EXTENT_SIZE {
                    return Err(corruption(
                        page_no,
                        format!("segment page beyond tablespace size {}", header.size(mtr)),
                        xdes.dump(mtr),
                    ));
                }
                if !extend::try_extend_data_file_with_pages(mtr, space, &header, page_no)? {
                    return Ok(None);
                }
            }
            mark_page_used(mtr, space, inode, &xdes, page_no)?;
            mtr.create_page(page_no, PageType::Allocated)?;
            page_no
        }
    };

    Ok(Some(AllocatedPage { page_no, strategy }))
}

/// Create a segment whose header is written at `offset` of `header_page`,
/// or of a newly allocated page when `header_page` is `None`
pub(crate) fn create(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header_page: Option<u32>,
    offset: u16,
) -> Result<Option<SegmentRef>> {
    let body_end = space.page_size() as usize - FIL_PAGE_DATA_END;
    if (offset as usize) < FIL_PAGE_DATA || offset as usize + FSEG_HEADER_SIZE > body_end {
        return Err(SpaceError::InvalidSegmentHeader {
            page_no: header_page.unwrap_or(0),
            offset,
        });
    }

    mtr.x_lock_space();
    if let Some(page_no) = header_page {
        mtr.fetch(page_no)?;
    }

    let Some(reservation) = reserve::reserve_free_extents(mtr, space, 2, AllocType::Normal, 2)?
    else {
        return Ok(None);
    };

    let Some(inode) = inode::alloc_inode(mtr, space)? else {
        return Ok(None);
    };

    let header = SpaceHeader::get(mtr, space.page_size())?;
    let seg_id = header.alloc_segment_id(mtr)?;
    inode.init(mtr, seg_id)?;

    let block = match header_page {
        Some(page_no) => mtr.fetch(page_no)?,
        None => match alloc_free_page_low(mtr, space, &inode, 0, Direction::Up)? {
            Some(page) => {
                let block = mtr.fetch(page.page_no)?;
                mtr.write_u16(block, FIL_PAGE_TYPE, PageType::Sys as u16)?;
                block
            }
            None => {
                inode::free_inode(mtr, space, &inode)?;
                return Ok(None);
            }
        },
    };

    inode::write_segment_header(mtr, block, offset as usize, space.config.space_id, &inode)?;
    reservation.release();

    tracing::debug!(
        "Created segment {} with header at {}:{}",
        seg_id,
        block.page_no(),
        offset
    );
    Ok(Some(SegmentRef::new(block.page_no(), offset)))
}

/// Allocate a page for `segment`. Unless the caller already holds a
/// reservation, two extents are reserved for the duration of the call.
pub(crate) fn alloc_page(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
    hint: u32,
    direction: Direction,
    has_reservation: bool,
) -> Result<Option<AllocatedPage>> {
    mtr.x_lock_space();
    let inode = inode::inode_get(mtr, space, segment)?;

    let reservation = if has_reservation {
        None
    } else {
        match reserve::reserve_free_extents(mtr, space, 2, AllocType::Normal, 2)? {
            Some(reservation) => Some(reservation),
            None => return Ok(None),
        }
    };

    let page = alloc_free_page_low(mtr, space, &inode, hint, direction)?;
    if let Some(reservation) = reservation {
        reservation.release();
    }
    Ok(page)
}

/// Return one page to the segment's extent, or to the tablespace if it was
/// a fragment page
pub(crate) fn free_page_low(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    inode: &Inode,
    page_no: u32,
) -> Result<()> {
    let header = SpaceHeader::get(mtr, space.page_size())?;
    let Some(xdes) = Xdes::lookup(mtr, &header, page_no)? else {
        return Err(corruption(
            page_no,
            "freeing a segment page outside the initialized tablespace",
            header.dump(mtr),
        ));
    };

    let group_off = page_no % space.page_size();
    let page_off = page_no % EXTENT_SIZE;
    if group_off == 0
        || group_off == FSP_IBUF_BITMAP_OFFSET
        || xdes.get_bit(mtr, BitKind::Free, page_off)
    {
        return Err(corruption(
            page_no,
            "freeing a segment page that is not in use",
            xdes.dump(mtr),
        ));
    }

    let seg_id = inode.id(mtr);
    let state = xdes.state(mtr)?;
    if !state.is_segment() {
        let Some(slot) = inode.find_frag_slot(mtr, page_no) else {
            return Err(corruption(
                page_no,
                format!("page is not a fragment page of segment {}", seg_id),
                inode.dump(mtr),
            ));
        };
        inode.set_frag_page(mtr, slot, None)?;
        return fsp::free_page(mtr, space, page_no);
    }

    if xdes.segment_id(mtr) != seg_id {
        return Err(corruption(
            page_no,
            format!(
                "page belongs to segment {}, not {}",
                xdes.segment_id(mtr),
                seg_id
            ),
            xdes.dump(mtr),
        ));
    }

    if xdes.is_full(mtr) {
        flst::remove(mtr, inode.list(SegList::Full), xdes.node())?;
        flst::add_last(mtr, inode.list(SegList::NotFull), xdes.node())?;
        inode.add_not_full_n_used(mtr, EXTENT_SIZE as i64 - 1)?;
    } else {
        inode.add_not_full_n_used(mtr, -1)?;
    }

    xdes.set_bit(mtr, BitKind::Free, page_off, true)?;
    xdes.set_bit(mtr, BitKind::Clean, page_off, true)?;

    if xdes.is_unused_by_segment(mtr)? {
        flst::remove(mtr, inode.list(SegList::NotFull), xdes.node())?;
        inode.add_not_full_n_used(mtr, -(xdes.overhead(space.page_size()) as i64))?;
        fsp::free_extent(mtr, space, &xdes)?;
        tracing::debug!("Segment {} returned extent {}", seg_id, xdes.first_page);
    }
    Ok(())
}

/// Free one page of `segment`
pub(crate) fn free_page(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
    page_no: u32,
) -> Result<()> {
    mtr.x_lock_space();
    let inode = inode::inode_get(mtr, space, segment)?;
    free_page_low(mtr, space, &inode, page_no)
}

/// Take a whole extent away from a segment and return it to the tablespace
fn free_extent(mtr: &mut Mtr<'_>, space: &Space<'_>, inode: &Inode, xdes: &Xdes) -> Result<()> {
    let seg_id = inode.id(mtr);
    if !xdes.in_segment(mtr, seg_id)? {
        return Err(corruption(
            xdes.first_page,
            format!("extent on a list of segment {} is not owned by it", seg_id),
            xdes.dump(mtr),
        ));
    }

    if xdes.is_full(mtr) {
        flst::remove(mtr, inode.list(SegList::Full), xdes.node())?;
    } else if xdes.is_unused_by_segment(mtr)? {
        flst::remove(mtr, inode.list(SegList::Free), xdes.node())?;
    } else {
        flst::remove(mtr, inode.list(SegList::NotFull), xdes.node())?;
        inode.add_not_full_n_used(mtr, -(xdes.n_used(mtr) as i64))?;
    }

    fsp::free_extent(mtr, space, xdes)
}

fn first_extent(mtr: &mut Mtr<'_>, space: &Space<'_>, inode: &Inode) -> Result<Option<Xdes>> {
    for list in [SegList::Full, SegList::NotFull, SegList::Free] {
        if let Some(xdes) = fsp::list_first_extent(mtr, space, inode.list(list))? {
            return Ok(Some(xdes));
        }
    }
    Ok(None)
}

/// Free one extent, or else one fragment page, of a segment. Returns `true`
/// once the segment is gone (its inode is freed).
pub(crate) fn free_step(mtr: &mut Mtr<'_>, space: &Space<'_>, segment: SegmentRef) -> Result<bool> {
    mtr.x_lock_space();
    let Some(inode) = inode::inode_try_get(mtr, space, segment)? else {
        return Ok(true);
    };

    if let Some(xdes) = first_extent(mtr, space, &inode)? {
        free_extent(mtr, space, &inode, &xdes)?;
        return Ok(false);
    }

    let Some(slot) = inode.find_last_used_frag_slot(mtr) else {
        inode::free_inode(mtr, space, &inode)?;
        return Ok(true);
    };
    if let Some(page_no) = inode.frag_page(mtr, slot) {
        free_page_low(mtr, space, &inode, page_no)?;
    }

    if inode.find_last_used_frag_slot(mtr).is_none() {
        inode::free_inode(mtr, space, &inode)?;
        return Ok(true);
    }
    Ok(false)
}

/// Like [`free_step`], but never frees the page holding the segment header
/// or the inode. Returns `true` when only that page is left.
pub(crate) fn free_step_not_header(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<bool> {
    mtr.x_lock_space();
    let Some(inode) = inode::inode_try_get(mtr, space, segment)? else {
        return Ok(true);
    };

    if let Some(xdes) = first_extent(mtr, space, &inode)? {
        free_extent(mtr, space, &inode, &xdes)?;
        return Ok(false);
    }

    let page_no = match inode.find_last_used_frag_slot(mtr) {
        Some(slot) => inode.frag_page(mtr, slot),
        None => None,
    };
    match page_no {
        Some(page_no) if page_no != segment.page_no => {
            free_page_low(mtr, space, &inode, page_no)?;
            Ok(false)
        }
        _ => Ok(true),
    }
}

/// `(reserved, used)` page counts of `segment`
pub(crate) fn n_reserved_pages(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<(u32, u32)> {
    let inode = inode::inode_get(mtr, space, segment)?;
    Ok(n_reserved_pages_low(mtr, &inode))
}

pub(crate) fn n_frag_pages(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<u32> {
    let inode = inode::inode_get(mtr, space, segment)?;
    Ok(inode.n_frag_pages(mtr))
}

fn extent_first_pages(mtr: &mut Mtr<'_>, space: &Space<'_>, inode: &Inode, list: SegList) -> Result<Vec<u32>> {
    flst::collect(mtr, inode.list(list))?
        .into_iter()
        .map(|node| Xdes::from_node(mtr, space.page_size(), node).map(|xdes| xdes.first_page))
        .collect()
}

pub(crate) fn segment_info(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    segment: SegmentRef,
) -> Result<SegmentInfo> {
    let inode = inode::inode_get(mtr, space, segment)?;
    let (reserved, used) = n_reserved_pages_low(mtr, &inode);
    Ok(SegmentInfo {
        id: inode.id(mtr),
        reserved,
        used,
        not_full_n_used: inode.not_full_n_used(mtr),
        frag_pages: inode.frag_pages(mtr),
        free: extent_first_pages(mtr, space, &inode, SegList::Free)?,
        not_full: extent_first_pages(mtr, space, &inode, SegList::NotFull)?,
        full: extent_first_pages(mtr, space, &inode, SegList::Full)?,
    })
}

/// A page above the free limit or marked free in its descriptor
pub(crate) fn page_is_free(mtr: &mut Mtr<'_>, space: &Space<'_>, page_no: u32) -> Result<bool> {
    let header = SpaceHeader::get(mtr, space.page_size())?;
    Ok(match Xdes::lookup(mtr, &header, page_no)? {
        Some(xdes) => xdes.get_bit(mtr, BitKind::Free, page_no % EXTENT_SIZE),
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::Fixture;
    use crate::config::{CorruptionPolicy, SpaceConfig};

    fn fixture(initial_size: u32, autoextend: bool) -> Fixture {
        Fixture::initialized(SpaceConfig {
            page_size: 4096,
            initial_size,
            autoextend,
            on_corruption: CorruptionPolicy::Propagate,
            ..Default::default()
        })
    }

    fn create_segment(fx: &Fixture) -> SegmentRef {
        let mut mtr = fx.mtr();
        let segment = create(&mut mtr, &fx.space(), None, FIL_PAGE_DATA as u16)
            .unwrap()
            .unwrap();
        mtr.commit().unwrap();
        segment
    }

    fn alloc(fx: &Fixture, segment: SegmentRef, hint: u32, direction: Direction) -> Option<AllocatedPage> {
        let mut mtr = fx.mtr();
        let page = alloc_page(&mut mtr, &fx.space(), segment, hint, direction, false).unwrap();
        mtr.commit().unwrap();
        page
    }

    fn info(fx: &Fixture, segment: SegmentRef) -> SegmentInfo {
        let mut mtr = fx.mtr();
        segment_info(&mut mtr, &fx.space(), segment).unwrap()
    }

    #[test]
    fn test_create_segment() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);

        // Page 2 became the inode page, page 3 holds the header
        assert_eq!(segment, SegmentRef::new(3, FIL_PAGE_DATA as u16));
        let info = info(&fx, segment);
        assert_eq!(info.id, 1);
        assert_eq!(info.frag_pages, vec![3]);
        assert_eq!((info.reserved, info.used), (1, 1));

        let mut mtr = fx.mtr();
        let block = mtr.fetch(3).unwrap();
        assert_eq!(mtr.page(block).page_type(), Some(PageType::Sys));
        assert_eq!(fx.state.lock().n_reserved_extents, 0);
    }

    #[test]
    fn test_create_with_existing_header_page() {
        let fx = fixture(1024, false);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let owner = fsp::alloc_free_page(&mut mtr, &space, 0, PageType::Index)
            .unwrap()
            .unwrap();
        let segment = create(&mut mtr, &space, Some(owner.page_no()), 200)
            .unwrap()
            .unwrap();
        mtr.commit().unwrap();

        assert_eq!(segment, SegmentRef::new(owner.page_no(), 200));
        let info = info(&fx, segment);
        assert!(info.frag_pages.is_empty());
        assert_eq!((info.reserved, info.used), (0, 0));
    }

    #[test]
    fn test_header_offset_must_fit() {
        let fx = fixture(1024, false);
        let mut mtr = fx.mtr();
        let err = create(&mut mtr, &fx.space(), None, 4090).unwrap_err();
        assert!(matches!(err, SpaceError::InvalidSegmentHeader { .. }));
    }

    #[test]
    fn test_fragment_pages_then_extent() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);

        for _ in 1..32 {
            let page = alloc(&fx, segment, 0, Direction::NoDir).unwrap();
            assert_eq!(page.strategy, AllocStrategy::FragmentPage);
        }
        assert_eq!(info(&fx, segment).used, 32);

        let page = alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        assert_eq!(page.strategy, AllocStrategy::NewExtent);
        assert_eq!(page.page_no % EXTENT_SIZE, 0);

        let info = info(&fx, segment);
        assert_eq!(info.not_full, vec![page.page_no]);
        assert_eq!(info.not_full_n_used, 1);
        assert_eq!((info.reserved, info.used), (32 + 64, 33));
    }

    #[test]
    fn test_hinted_page_and_extent_fill() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        for _ in 1..32 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }
        let first = alloc(&fx, segment, 0, Direction::NoDir).unwrap().page_no;

        // Hinted page inside the segment's own extent
        let page = alloc(&fx, segment, first + 10, Direction::NoDir).unwrap();
        assert_eq!(page, AllocatedPage { page_no: first + 10, strategy: AllocStrategy::HintedPage });

        // Hint already used: next free page of that extent
        let page = alloc(&fx, segment, first + 10, Direction::NoDir).unwrap();
        assert_eq!(page.strategy, AllocStrategy::HintedExtentFreePage);
        assert_eq!(page.page_no, first + 11);

        // Fill the extent; it moves to FULL
        while info(&fx, segment).full.is_empty() {
            let page = alloc(&fx, segment, first, Direction::NoDir).unwrap();
            assert!(page.page_no >= first && page.page_no < first + EXTENT_SIZE);
        }
        let info = info(&fx, segment);
        assert!(info.not_full.is_empty());
        assert_eq!(info.not_full_n_used, 0);
        assert_eq!(info.used, 32 + 64);
    }

    #[test]
    fn test_hinted_extent_claims_free_extent() {
        let fx = fixture(8192, false);
        let segment = create_segment(&fx);
        for _ in 1..32 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }
        let first = alloc(&fx, segment, 0, Direction::NoDir).unwrap().page_no;
        while info(&fx, segment).full.is_empty() {
            alloc(&fx, segment, first, Direction::NoDir).unwrap();
        }

        let hint = 4 * EXTENT_SIZE + 5;
        assert_ne!(first, 4 * EXTENT_SIZE);
        {
            let mut mtr = fx.mtr();
            let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
            let xdes = Xdes::lookup(&mut mtr, &header, hint).unwrap().unwrap();
            assert_eq!(xdes.state(&mtr).unwrap(), XdesState::Free);
        }

        let page = alloc(&fx, segment, hint, Direction::NoDir).unwrap();
        assert_eq!(page, AllocatedPage { page_no: hint, strategy: AllocStrategy::HintedExtent });

        let info = info(&fx, segment);
        assert_eq!(info.not_full, vec![4 * EXTENT_SIZE]);
        assert_eq!(info.not_full_n_used, 1);
        assert_eq!((info.reserved, info.used), (32 + 128, 32 + 64 + 1));
    }

    #[test]
    fn test_large_segment_prefills_free_list() {
        let fx = fixture(8192, false);
        let segment = create_segment(&fx);
        let limit = (FSEG_FREE_LIST_LIMIT + 1) * EXTENT_SIZE;

        let mut seg = info(&fx, segment);
        while seg.reserved < limit {
            // Below the limit a claimed extent is used right away
            assert!(seg.free.is_empty());
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
            seg = info(&fx, segment);
        }

        assert!(!seg.free.is_empty());
        assert!(seg.free.len() <= FSEG_FREE_LIST_MAX_LEN as usize);
        for pair in seg.free.windows(2) {
            assert_eq!(pair[1], pair[0] + EXTENT_SIZE);
        }
        assert!(seg.reserved - seg.used >= EXTENT_SIZE * seg.free.len() as u32);

        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        for &first_page in &seg.free {
            let xdes = Xdes::lookup(&mut mtr, &header, first_page).unwrap().unwrap();
            assert_eq!(xdes.state(&mtr).unwrap(), XdesState::Fseg);
            assert_eq!(xdes.segment_id(&mtr), seg.id);
            assert_eq!(xdes.n_used(&mtr), 0);
        }
    }

    #[test]
    fn test_directional_extent() {
        let fx = fixture(2048, false);
        let segment = create_segment(&fx);
        for _ in 1..32 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }
        // Fill one extent so the segment is well used
        let first = alloc(&fx, segment, 0, Direction::NoDir).unwrap().page_no;
        while info(&fx, segment).full.is_empty() {
            alloc(&fx, segment, first, Direction::NoDir).unwrap();
        }

        let page = alloc(&fx, segment, first + 63, Direction::Down).unwrap();
        assert_eq!(page.strategy, AllocStrategy::DirectionalExtent);
        assert_eq!(page.page_no % EXTENT_SIZE, EXTENT_SIZE - 1);
    }

    #[test]
    fn test_free_extent_pages_returns_extent() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        for _ in 1..32 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }
        let first = alloc(&fx, segment, 0, Direction::NoDir).unwrap().page_no;
        let mut pages = vec![first];
        for _ in 0..5 {
            pages.push(alloc(&fx, segment, first, Direction::NoDir).unwrap().page_no);
        }

        let free_before = {
            let mut mtr = fx.mtr();
            SpaceHeader::get(&mut mtr, 4096).unwrap().list_len(&mtr, SpaceList::Free)
        };

        for page_no in pages {
            let mut mtr = fx.mtr();
            free_page(&mut mtr, &fx.space(), segment, page_no).unwrap();
            mtr.commit().unwrap();
        }

        let info = info(&fx, segment);
        assert!(info.not_full.is_empty());
        assert_eq!(info.not_full_n_used, 0);

        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.list_len(&mtr, SpaceList::Free), free_before + 1);
        let xdes = Xdes::lookup(&mut mtr, &header, first).unwrap().unwrap();
        assert_eq!(xdes.state(&mtr).unwrap(), XdesState::Free);
    }

    #[test]
    fn test_free_page_not_owned() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let other = fsp::alloc_free_page(&mut mtr, &space, 0, PageType::Index)
            .unwrap()
            .unwrap();
        let err = free_page(&mut mtr, &space, segment, other.page_no()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_double_free_segment_page() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        let page = alloc(&fx, segment, 0, Direction::NoDir).unwrap();

        let mut mtr = fx.mtr();
        let space = fx.space();
        free_page(&mut mtr, &space, segment, page.page_no).unwrap();
        assert!(free_page(&mut mtr, &space, segment, page.page_no)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_free_step_tears_down() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        for _ in 0..40 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }

        let mut steps = 0;
        loop {
            let mut mtr = fx.mtr();
            let done = free_step(&mut mtr, &fx.space(), segment).unwrap();
            mtr.commit().unwrap();
            steps += 1;
            if done {
                break;
            }
        }
        // One extent, then 32 fragment pages
        assert_eq!(steps, 33);

        let mut mtr = fx.mtr();
        let space = fx.space();
        assert!(free_step(&mut mtr, &space, segment).unwrap());
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.frag_n_used(&mtr), 2);
        assert_eq!(header.list_len(&mtr, SpaceList::SegInodesFree), 0);
    }

    #[test]
    fn test_free_step_not_header_keeps_header_page() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        for _ in 0..5 {
            alloc(&fx, segment, 0, Direction::NoDir).unwrap();
        }

        loop {
            let mut mtr = fx.mtr();
            let done = free_step_not_header(&mut mtr, &fx.space(), segment).unwrap();
            mtr.commit().unwrap();
            if done {
                break;
            }
        }

        let info = info(&fx, segment);
        assert_eq!(info.frag_pages, vec![segment.page_no]);
    }

    #[test]
    fn test_page_is_free() {
        let fx = fixture(1024, false);
        let segment = create_segment(&fx);
        let page = alloc(&fx, segment, 0, Direction::NoDir).unwrap();

        let mut mtr = fx.mtr();
        let space = fx.space();
        assert!(!page_is_free(&mut mtr, &space, page.page_no).unwrap());
        assert!(!page_is_free(&mut mtr, &space, 0).unwrap());
        assert!(page_is_free(&mut mtr, &space, 100).unwrap());
        assert!(page_is_free(&mut mtr, &space, 1000).unwrap());
    }

    #[test]
    fn test_lease_descriptor_extent() {
        // 4 KiB pages: page 4096 starts the second descriptor group
        let fx = fixture(4096 + 128, false);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let inode = inode::alloc_inode(&mut mtr, &space).unwrap().unwrap();
        inode.init(&mut mtr, 99).unwrap();

        // Drain FREE so only the leasable extent is left
        while fsp::alloc_free_extent(&mut mtr, &space, 0).unwrap().is_some() {}

        let xdes = alloc_free_extent(&mut mtr, &space, &inode).unwrap().unwrap();
        assert_eq!(xdes.first_page, 4096);
        assert_eq!(xdes.state(&mtr).unwrap(), XdesState::FsegFrag);
        assert_eq!(xdes.segment_id(&mtr), 99);

        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        // Extent 0 keeps pages 0, 1 and the inode page
        assert_eq!(header.frag_n_used(&mtr), 3);

        // The first usable page skips the descriptor and bitmap pages
        let page = alloc_free_page_low(&mut mtr, &space, &inode, 0, Direction::NoDir)
            .unwrap()
            .unwrap();
        assert_eq!(page.page_no, 4096 + 2);
        assert_eq!(inode.not_full_n_used(&mtr), 3);

        // Freeing the only page hands the extent back to FREE_FRAG
        free_page_low(&mut mtr, &space, &inode, page.page_no).unwrap();
        assert_eq!(xdes.state(&mtr).unwrap(), XdesState::FreeFrag);
        assert_eq!(inode.not_full_n_used(&mtr), 0);
        assert_eq!(header.frag_n_used(&mtr), 5);
    }
}
