//! Page selection for segment allocation
//!
//! A segment picks the page to hand out by trying an ordered list of
//! strategies; the first one that yields a candidate wins. Each strategy is
//! a plain function over an [`AllocRequest`] snapshot taken before the
//! cascade starts. Strategies 2, 3 and 7 may claim whole extents for the
//! segment on their way to a candidate; the others only look.

use super::fseg;
use super::fsp;
use super::inode::{Inode, SegList};
use super::xdes::{BitKind, Xdes, XdesState};
use super::{Direction, Space, FSEG_FRAG_LIMIT, XDES_FRAG_N_USED};
use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::{PageType, EXTENT_SIZE};
use serde::Serialize;

/// Which rule of the cascade produced a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AllocStrategy {
    /// The hinted page itself, in an extent the segment owns
    HintedPage,
    /// The whole free extent around the hint, claimed for the segment
    HintedExtent,
    /// A fresh extent at the end matching the growth direction
    DirectionalExtent,
    /// Another free page of the segment-owned extent around the hint
    HintedExtentFreePage,
    /// Any free page in an extent the segment already holds
    SegmentExtent,
    /// A fragment page from the tablespace
    FragmentPage,
    /// The first usable page of a newly claimed extent
    NewExtent,
}

/// Inputs shared by every strategy
pub(crate) struct AllocRequest {
    pub inode: Inode,
    pub seg_id: u64,
    pub hint: u32,
    /// Descriptor of the extent containing `hint`
    pub hint_descr: Xdes,
    pub direction: Direction,
    /// Pages reserved by the segment: extents plus fragment pages
    pub reserved: u32,
    /// Pages the segment has in use
    pub used: u32,
}

impl AllocRequest {
    /// The segment is well filled and has outgrown its fragment slots, so it
    /// may claim whole extents
    fn may_claim_extent(&self, space: &Space<'_>) -> bool {
        let slack = (self.reserved - self.used) as f64;
        let threshold = self.reserved as f64 * space.config.segment_reserve_factor / 100.0;
        self.used >= FSEG_FRAG_LIMIT && slack < threshold
    }
}

/// What a strategy proposes
#[derive(Debug, Clone, Copy)]
pub(crate) enum Candidate {
    /// A free page inside an extent owned by the segment; the caller still
    /// has to mark it used and create it
    InExtent { page_no: u32, xdes: Xdes },
    /// A fragment page, already allocated and created
    Fragment(Block),
}

type Strategy = fn(&mut Mtr<'_>, &Space<'_>, &AllocRequest) -> Result<Option<Candidate>>;

pub(crate) const STRATEGIES: [(AllocStrategy, Strategy); 7] = [
    (AllocStrategy::HintedPage, hinted_page),
    (AllocStrategy::HintedExtent, hinted_extent),
    (AllocStrategy::DirectionalExtent, directional_extent),
    (AllocStrategy::HintedExtentFreePage, hinted_extent_free_page),
    (AllocStrategy::SegmentExtent, segment_extent),
    (AllocStrategy::FragmentPage, fragment_page),
    (AllocStrategy::NewExtent, new_extent),
];

/// Run the cascade and return the first candidate found
pub(crate) fn pick(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<(AllocStrategy, Candidate)>> {
    for (strategy, attempt) in STRATEGIES {
        if let Some(candidate) = attempt(mtr, space, request)? {
            tracing::trace!(
                "Segment {} hint {}: {:?} -> {:?}",
                request.seg_id,
                request.hint,
                strategy,
                candidate
            );
            return Ok(Some((strategy, candidate)));
        }
    }
    Ok(None)
}

/// First page a segment may use in a newly claimed extent
fn first_usable_page(mtr: &Mtr<'_>, xdes: &Xdes) -> Result<u32> {
    Ok(match xdes.state(mtr)? {
        XdesState::FsegFrag => xdes.first_page + XDES_FRAG_N_USED,
        _ => xdes.first_page,
    })
}

fn hinted_page(
    mtr: &mut Mtr<'_>,
    _space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    let xdes = request.hint_descr;
    if xdes.in_segment(mtr, request.seg_id)?
        && xdes.get_bit(mtr, BitKind::Free, request.hint % EXTENT_SIZE)
    {
        return Ok(Some(Candidate::InExtent {
            page_no: request.hint,
            xdes,
        }));
    }
    Ok(None)
}

fn hinted_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    if request.hint_descr.state(mtr)? != XdesState::Free || !request.may_claim_extent(space) {
        return Ok(None);
    }

    let Some(xdes) = fsp::alloc_free_extent(mtr, space, request.hint)? else {
        return Ok(None);
    };
    xdes.set_segment_id_and_state(mtr, request.seg_id, XdesState::Fseg)?;

    // Prefill from the extents after this one while the segment FREE list is
    // still empty
    fseg::fill_free_list(mtr, space, &request.inode, xdes.first_page + EXTENT_SIZE)?;
    super::flst::add_last(mtr, request.inode.list(SegList::Free), xdes.node())?;

    let page_no = if xdes.first_page == request.hint_descr.first_page {
        request.hint
    } else {
        xdes.first_page
    };
    Ok(Some(Candidate::InExtent { page_no, xdes }))
}

fn directional_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    if request.direction == Direction::NoDir || !request.may_claim_extent(space) {
        return Ok(None);
    }

    let Some(xdes) = fseg::alloc_free_extent(mtr, space, &request.inode)? else {
        return Ok(None);
    };
    let page_no = match request.direction {
        Direction::Down => xdes.first_page + EXTENT_SIZE - 1,
        _ => first_usable_page(mtr, &xdes)?,
    };
    Ok(Some(Candidate::InExtent { page_no, xdes }))
}

fn hinted_extent_free_page(
    mtr: &mut Mtr<'_>,
    _space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    let xdes = request.hint_descr;
    if !xdes.in_segment(mtr, request.seg_id)? || xdes.is_full(mtr) {
        return Ok(None);
    }

    Ok(xdes
        .find_bit(mtr, BitKind::Free, true, request.hint % EXTENT_SIZE)
        .map(|page_off| Candidate::InExtent {
            page_no: xdes.first_page + page_off,
            xdes,
        }))
}

fn segment_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    if request.reserved <= request.used {
        return Ok(None);
    }

    let inode = &request.inode;
    let xdes = match fsp::list_first_extent(mtr, space, inode.list(SegList::NotFull))? {
        Some(xdes) => xdes,
        None => match fsp::list_first_extent(mtr, space, inode.list(SegList::Free))? {
            Some(xdes) => xdes,
            None => {
                return Err(corruption(
                    inode.block.page_no(),
                    format!(
                        "segment {} reserves {} pages, uses {}, but holds no extent with room",
                        request.seg_id, request.reserved, request.used
                    ),
                    inode.dump(mtr),
                ))
            }
        },
    };

    let Some(page_off) = xdes.find_bit(mtr, BitKind::Free, true, 0) else {
        return Err(corruption(
            xdes.first_page,
            "segment extent on FREE or NOT_FULL has no free page",
            xdes.dump(mtr),
        ));
    };
    Ok(Some(Candidate::InExtent {
        page_no: xdes.first_page + page_off,
        xdes,
    }))
}

fn fragment_page(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    if request.used >= FSEG_FRAG_LIMIT {
        return Ok(None);
    }

    let Some(block) = fsp::alloc_free_page(mtr, space, request.hint, PageType::Allocated)? else {
        return Ok(None);
    };

    let inode = &request.inode;
    let Some(slot) = inode.find_free_frag_slot(mtr) else {
        return Err(corruption(
            inode.block.page_no(),
            format!("segment {} has no free fragment slot", request.seg_id),
            inode.dump(mtr),
        ));
    };
    inode.set_frag_page(mtr, slot, Some(block.page_no()))?;
    Ok(Some(Candidate::Fragment(block)))
}

fn new_extent(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    request: &AllocRequest,
) -> Result<Option<Candidate>> {
    let Some(xdes) = fseg::alloc_free_extent(mtr, space, &request.inode)? else {
        return Ok(None);
    };
    let page_no = first_usable_page(mtr, &xdes)?;
    Ok(Some(Candidate::InExtent { page_no, xdes }))
}
