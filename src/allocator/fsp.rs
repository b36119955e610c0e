//! Tablespace-level allocation
//!
//! Hands out single fragment pages (from FREE_FRAG extents) and whole free
//! extents, and takes them back. Segments build on these in [`super::fseg`].

use super::extend;
use super::flst::{self, ListBase};
use super::header::{encode_flags, SpaceHeader, SpaceList};
use super::xdes::{BitKind, Xdes, XdesState};
use super::{Space, FSP_FREE_ADD, FSP_IBUF_BITMAP_OFFSET, XDES_FRAG_N_USED};
use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::{PageType, EXTENT_SIZE};

/// Create page 0 and lay out a fresh tablespace of `size` pages
pub(crate) fn init(mtr: &mut Mtr<'_>, space: &Space<'_>, size: u32) -> Result<()> {
    let block = mtr.create_page(0, PageType::FspHdr)?;
    let flags = encode_flags(space.page_size(), space.config.kind);
    let header = SpaceHeader::init(
        mtr,
        block,
        space.config.space_id,
        size,
        flags,
        space.page_size(),
    )?;

    fill_free_list(mtr, space, &header, true)
}

/// First extent on a list of extent descriptors
pub(crate) fn list_first_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    base: ListBase,
) -> Result<Option<Xdes>> {
    let first = flst::first(mtr, base);
    if first.is_null() {
        return Ok(None);
    }
    Xdes::from_node(mtr, space.page_size(), first).map(Some)
}

/// Put a descriptor-group first extent on FREE_FRAG with its descriptor and
/// bitmap pages marked used
fn init_xdes_free_frag(mtr: &mut Mtr<'_>, header: &SpaceHeader, xdes: &Xdes) -> Result<()> {
    xdes.set_bit(mtr, BitKind::Free, 0, false)?;
    xdes.set_bit(mtr, BitKind::Free, FSP_IBUF_BITMAP_OFFSET, false)?;
    xdes.set_state(mtr, XdesState::FreeFrag)?;
    flst::add_last(mtr, header.list(SpaceList::FreeFrag), xdes.node())?;
    header.add_frag_n_used(mtr, XDES_FRAG_N_USED as i64)
}

/// Initialize extents above the free limit and put them on FREE.
///
/// At most [`FSP_FREE_ADD`] ordinary extents are added per call. Extents
/// starting a descriptor group get their descriptor and bitmap pages created
/// and go to FREE_FRAG instead. When the tablespace is close to full the
/// file is grown first. During creation (`init_space`) the first extent is
/// initialized even if the tablespace is smaller than one extent.
pub(crate) fn fill_free_list(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    init_space: bool,
) -> Result<()> {
    let page_size = space.page_size();
    let mut size = header.size(mtr);
    let limit = header.free_limit(mtr);

    if !init_space && size < limit + EXTENT_SIZE * FSP_FREE_ADD {
        extend::try_extend_data_file(mtr, space, header, 0)?;
        size = header.size(mtr);
    }

    let mut i = limit;
    let mut count = 0;
    while (init_space && i < 1) || (i + EXTENT_SIZE <= size && count < FSP_FREE_ADD) {
        let init_xdes = i % page_size == 0;

        header.set_free_limit(mtr, i + EXTENT_SIZE)?;

        if init_xdes {
            if i > 0 {
                mtr.create_page(i, PageType::Xdes)?;
            }
            if i + FSP_IBUF_BITMAP_OFFSET < size {
                mtr.create_page(i + FSP_IBUF_BITMAP_OFFSET, PageType::IbufBitmap)?;
            }
        }

        let xdes = Xdes::locate(mtr, header, i)?;
        xdes.init(mtr)?;

        if init_xdes {
            init_xdes_free_frag(mtr, header, &xdes)?;
        } else {
            flst::add_last(mtr, header.list(SpaceList::Free), xdes.node())?;
            count += 1;
        }

        i += EXTENT_SIZE;
    }

    tracing::debug!(
        "Filled free list: {} extents added, free limit now {}",
        count,
        header.free_limit(mtr)
    );
    Ok(())
}

/// Take a whole free extent off the FREE list.
///
/// Prefers the extent containing `hint`. The extent is returned in state
/// FREE and on no list; the caller decides where it goes next.
pub(crate) fn alloc_free_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    hint: u32,
) -> Result<Option<Xdes>> {
    let header = SpaceHeader::get(mtr, space.page_size())?;

    let hinted = match Xdes::lookup(mtr, &header, hint)? {
        Some(xdes) if xdes.state(mtr)? == XdesState::Free => Some(xdes),
        _ => None,
    };

    let xdes = match hinted {
        Some(xdes) => xdes,
        None => {
            let free = header.list(SpaceList::Free);
            if flst::len(mtr, free) == 0 {
                fill_free_list(mtr, space, &header, false)?;
            }
            match list_first_extent(mtr, space, free)? {
                Some(xdes) => xdes,
                None => {
                    tracing::warn!("No free extents left in tablespace");
                    return Ok(None);
                }
            }
        }
    };

    flst::remove(mtr, header.list(SpaceList::Free), xdes.node())?;
    tracing::debug!("Allocated free extent at page {}", xdes.first_page);
    Ok(Some(xdes))
}

/// Mark one page of a FREE_FRAG extent used
fn alloc_from_free_frag(
    mtr: &mut Mtr<'_>,
    header: &SpaceHeader,
    xdes: &Xdes,
    page_off: u32,
) -> Result<()> {
    xdes.set_bit(mtr, BitKind::Free, page_off, false)?;
    header.add_frag_n_used(mtr, 1)?;

    if xdes.is_full(mtr) {
        flst::remove(mtr, header.list(SpaceList::FreeFrag), xdes.node())?;
        xdes.set_state(mtr, XdesState::FullFrag)?;
        flst::add_last(mtr, header.list(SpaceList::FullFrag), xdes.node())?;
        header.add_frag_n_used(mtr, -(EXTENT_SIZE as i64))?;
    }
    Ok(())
}

/// Allocate a single fragment page and initialize it as `page_type`.
///
/// Prefers the extent containing `hint` when it is a FREE_FRAG extent.
/// Returns `None` when the tablespace is out of space.
pub(crate) fn alloc_free_page(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    hint: u32,
    page_type: PageType,
) -> Result<Option<Block>> {
    let header = SpaceHeader::get(mtr, space.page_size())?;

    let hinted = match Xdes::lookup(mtr, &header, hint)? {
        Some(xdes) if xdes.state(mtr)? == XdesState::FreeFrag => Some(xdes),
        _ => None,
    };

    let (xdes, hint) = match hinted {
        Some(xdes) => (xdes, hint),
        None => {
            let free_frag = header.list(SpaceList::FreeFrag);
            let xdes = match list_first_extent(mtr, space, free_frag)? {
                Some(xdes) => xdes,
                None => {
                    let Some(xdes) = alloc_free_extent(mtr, space, hint)? else {
                        return Ok(None);
                    };
                    xdes.set_state(mtr, XdesState::FreeFrag)?;
                    flst::add_last(mtr, free_frag, xdes.node())?;
                    xdes
                }
            };
            (xdes, 0)
        }
    };

    let Some(page_off) = xdes.find_bit(mtr, BitKind::Free, true, hint % EXTENT_SIZE) else {
        return Err(corruption(
            xdes.first_page,
            "FREE_FRAG extent has no free page",
            xdes.dump(mtr),
        ));
    };
    let page_no = xdes.first_page + page_off;

    if page_no >= header.size(mtr) {
        // Only a tablespace smaller than one extent has allocatable pages
        // past its end
        if page_no >= EXTENT_SIZE {
            return Err(corruption(
                page_no,
                format!(
                    "free fragment page beyond tablespace size {}",
                    header.size(mtr)
                ),
                xdes.dump(mtr),
            ));
        }
        if !extend::try_extend_data_file_with_pages(mtr, space, &header, page_no)? {
            return Ok(None);
        }
    }

    alloc_from_free_frag(mtr, &header, &xdes, page_off)?;
    let block = mtr.create_page(page_no, page_type)?;

    tracing::trace!("Allocated fragment page {}", page_no);
    Ok(Some(block))
}

/// Return a fragment page to its FREE_FRAG or FULL_FRAG extent
pub(crate) fn free_page(mtr: &mut Mtr<'_>, space: &Space<'_>, page_no: u32) -> Result<()> {
    let header = SpaceHeader::get(mtr, space.page_size())?;

    let Some(xdes) = Xdes::lookup(mtr, &header, page_no)? else {
        return Err(corruption(
            page_no,
            "freeing a page outside the initialized tablespace",
            header.dump(mtr),
        ));
    };

    let group_off = page_no % space.page_size();
    if group_off == 0 || group_off == FSP_IBUF_BITMAP_OFFSET {
        return Err(corruption(
            page_no,
            "freeing a descriptor or bitmap page",
            xdes.dump(mtr),
        ));
    }

    let state = xdes.state(mtr)?;
    if state != XdesState::FreeFrag && state != XdesState::FullFrag {
        return Err(corruption(
            page_no,
            format!("freeing fragment page in extent of state {:?}", state),
            xdes.dump(mtr),
        ));
    }

    let page_off = page_no % EXTENT_SIZE;
    if xdes.get_bit(mtr, BitKind::Free, page_off) {
        return Err(corruption(
            page_no,
            "freeing a page that is already free",
            xdes.dump(mtr),
        ));
    }

    xdes.set_bit(mtr, BitKind::Free, page_off, true)?;
    xdes.set_bit(mtr, BitKind::Clean, page_off, true)?;

    if state == XdesState::FullFrag {
        flst::remove(mtr, header.list(SpaceList::FullFrag), xdes.node())?;
        xdes.set_state(mtr, XdesState::FreeFrag)?;
        flst::add_last(mtr, header.list(SpaceList::FreeFrag), xdes.node())?;
        header.add_frag_n_used(mtr, EXTENT_SIZE as i64 - 1)?;
    } else {
        header.add_frag_n_used(mtr, -1)?;
    }

    if xdes.is_free(mtr) {
        flst::remove(mtr, header.list(SpaceList::FreeFrag), xdes.node())?;
        free_extent(mtr, space, &xdes)?;
    }

    tracing::trace!("Freed fragment page {}", page_no);
    Ok(())
}

/// Return an extent to the tablespace.
///
/// The extent must already be off every list. A leased extent goes back to
/// FREE_FRAG with its descriptor pages marked used; everything else goes to
/// FREE.
pub(crate) fn free_extent(mtr: &mut Mtr<'_>, space: &Space<'_>, xdes: &Xdes) -> Result<()> {
    let header = SpaceHeader::get(mtr, space.page_size())?;

    match xdes.state(mtr)? {
        XdesState::FsegFrag => {
            xdes.init(mtr)?;
            init_xdes_free_frag(mtr, &header, xdes)?;
        }
        XdesState::Fseg | XdesState::FreeFrag => {
            xdes.init(mtr)?;
            flst::add_last(mtr, header.list(SpaceList::Free), xdes.node())?;
        }
        XdesState::FullFrag => {
            xdes.set_state(mtr, XdesState::FreeFrag)?;
            xdes.init(mtr)?;
            flst::add_last(mtr, header.list(SpaceList::Free), xdes.node())?;
        }
        state @ (XdesState::Free | XdesState::NotInited) => {
            return Err(corruption(
                xdes.first_page,
                format!("freeing an extent in state {:?}", state),
                xdes.dump(mtr),
            ));
        }
    }

    tracing::debug!("Returned extent at page {} to the tablespace", xdes.first_page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::Fixture;
    use crate::config::{CorruptionPolicy, SpaceConfig};

    fn lens(fx: &Fixture) -> (u32, u32, u32, u32) {
        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, fx.config.page_size).unwrap();
        (
            header.list_len(&mtr, SpaceList::Free),
            header.list_len(&mtr, SpaceList::FreeFrag),
            header.list_len(&mtr, SpaceList::FullFrag),
            header.frag_n_used(&mtr),
        )
    }

    fn fixture(initial_size: u32) -> Fixture {
        Fixture::initialized(SpaceConfig {
            page_size: 4096,
            initial_size,
            autoextend: false,
            on_corruption: CorruptionPolicy::Propagate,
            ..Default::default()
        })
    }

    #[test]
    fn test_init_layout() {
        let fx = fixture(256);
        assert_eq!(lens(&fx), (3, 1, 0, 2));

        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.free_limit(&mtr), 256);
        assert_eq!(header.size(&mtr), 256);
        let info = header.info(&mtr);
        assert_eq!(info.page_size, Some(4096));

        let page1 = mtr.fetch(1).unwrap();
        assert_eq!(mtr.page(page1).page_type(), Some(PageType::IbufBitmap));
    }

    #[test]
    fn test_init_adds_bounded_batch() {
        let fx = fixture(1024);
        assert_eq!(lens(&fx), (FSP_FREE_ADD, 1, 0, 2));

        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.free_limit(&mtr), (FSP_FREE_ADD + 1) * EXTENT_SIZE);
    }

    #[test]
    fn test_tiny_space_initializes_first_extent() {
        let fx = fixture(8);
        assert_eq!(lens(&fx), (0, 1, 0, 2));

        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        assert_eq!(header.free_limit(&mtr), EXTENT_SIZE);
        assert!(header.info(&mtr).limits_consistent());
    }

    #[test]
    fn test_alloc_pages_fill_fragment_extent() {
        let fx = fixture(64);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let mut pages = Vec::new();
        while let Some(block) = alloc_free_page(&mut mtr, &space, 0, PageType::Allocated).unwrap()
        {
            pages.push(block.page_no());
        }
        mtr.commit().unwrap();

        assert_eq!(pages, (2..64).collect::<Vec<_>>());
        // Extent 0 is now full: FULL_FRAG, and frag_n_used rebased to zero
        assert_eq!(lens(&fx), (0, 0, 1, 0));
    }

    #[test]
    fn test_alloc_prefers_hinted_extent() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        let space = fx.space();
        // Move extent 128 to FREE_FRAG
        let first = alloc_free_page(&mut mtr, &space, 0, PageType::Allocated)
            .unwrap()
            .unwrap();
        assert_eq!(first.page_no(), 2);

        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        let xdes = alloc_free_extent(&mut mtr, &space, 128).unwrap().unwrap();
        assert_eq!(xdes.first_page, 128);
        xdes.set_state(&mut mtr, XdesState::FreeFrag).unwrap();
        flst::add_last(&mut mtr, header.list(SpaceList::FreeFrag), xdes.node()).unwrap();

        let block = alloc_free_page(&mut mtr, &space, 140, PageType::Allocated)
            .unwrap()
            .unwrap();
        assert_eq!(block.page_no(), 140);
        assert_eq!(mtr.page(block).page_type(), Some(PageType::Allocated));
    }

    #[test]
    fn test_free_page_round_trip() {
        let fx = fixture(256);
        let before = lens(&fx);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let block = alloc_free_page(&mut mtr, &space, 0, PageType::Allocated)
            .unwrap()
            .unwrap();
        mtr.commit().unwrap();
        assert_eq!(lens(&fx).3, before.3 + 1);

        let mut mtr = fx.mtr();
        free_page(&mut mtr, &fx.space(), block.page_no()).unwrap();
        mtr.commit().unwrap();
        assert_eq!(lens(&fx), before);
    }

    #[test]
    fn test_free_page_from_full_frag() {
        let fx = fixture(64);

        let mut mtr = fx.mtr();
        let space = fx.space();
        while alloc_free_page(&mut mtr, &space, 0, PageType::Allocated)
            .unwrap()
            .is_some()
        {}
        free_page(&mut mtr, &space, 30).unwrap();
        mtr.commit().unwrap();

        assert_eq!(lens(&fx), (0, 1, 0, 63));

        // The freed page is handed out again
        let mut mtr = fx.mtr();
        let block = alloc_free_page(&mut mtr, &fx.space(), 0, PageType::Allocated)
            .unwrap()
            .unwrap();
        assert_eq!(block.page_no(), 30);
    }

    #[test]
    fn test_double_free_is_corruption() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let block = alloc_free_page(&mut mtr, &space, 0, PageType::Allocated)
            .unwrap()
            .unwrap();
        // Keep one more page so the extent stays on FREE_FRAG
        alloc_free_page(&mut mtr, &space, 0, PageType::Allocated)
            .unwrap()
            .unwrap();
        free_page(&mut mtr, &space, block.page_no()).unwrap();

        let err = free_page(&mut mtr, &space, block.page_no()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_free_page_in_free_extent_is_corruption() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        let err = free_page(&mut mtr, &fx.space(), 70).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_descriptor_pages_cannot_be_freed() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        assert!(free_page(&mut mtr, &fx.space(), 0).unwrap_err().is_corruption());
        assert!(free_page(&mut mtr, &fx.space(), 1).unwrap_err().is_corruption());
    }

    #[test]
    fn test_alloc_free_extent_exhaustion() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let mut firsts = Vec::new();
        while let Some(xdes) = alloc_free_extent(&mut mtr, &space, 0).unwrap() {
            firsts.push(xdes.first_page);
        }
        assert_eq!(firsts, vec![64, 128, 192]);
    }

    #[test]
    fn test_free_extent_dispatch() {
        let fx = fixture(256);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let xdes = alloc_free_extent(&mut mtr, &space, 64).unwrap().unwrap();

        // Off every list and still FREE: returning it is corruption
        assert!(free_extent(&mut mtr, &space, &xdes)
            .unwrap_err()
            .is_corruption());

        xdes.set_segment_id_and_state(&mut mtr, 7, XdesState::Fseg)
            .unwrap();
        xdes.set_bit(&mut mtr, BitKind::Free, 3, false).unwrap();
        free_extent(&mut mtr, &space, &xdes).unwrap();

        assert_eq!(xdes.state(&mtr).unwrap(), XdesState::Free);
        assert_eq!(xdes.segment_id(&mtr), 0);
        assert!(xdes.is_free(&mtr));
        mtr.commit().unwrap();
        assert_eq!(lens(&fx).0, 3);
    }

    #[test]
    fn test_second_descriptor_group() {
        // 4 KiB pages: one descriptor page every 4096 pages
        let fx = fixture(4096 + 128);

        let mut mtr = fx.mtr();
        let space = fx.space();
        let mut taken = 0;
        while alloc_free_extent(&mut mtr, &space, 0).unwrap().is_some() {
            taken += 1;
        }
        // 63 ordinary extents in group 0, one in group 1
        assert_eq!(taken, 64);

        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        let xdes = Xdes::lookup(&mut mtr, &header, 4096).unwrap().unwrap();
        assert_eq!(xdes.state(&mtr).unwrap(), XdesState::FreeFrag);
        assert_eq!(xdes.n_used(&mtr), 2);
        assert!(xdes.is_leasable(&mtr, 4096).unwrap());

        let descr_page = mtr.fetch(4096).unwrap();
        assert_eq!(mtr.page(descr_page).page_type(), Some(PageType::Xdes));
        assert_eq!(header.frag_n_used(&mtr), 4);
    }
}
