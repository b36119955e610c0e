//! Extent reservations
//!
//! Operations that may need several pages (a B-tree split, segment
//! creation) first reserve free extents so they cannot run out halfway.
//! The reservation is only a counter in [`SpaceState`]; the extents stay
//! on the FREE list and are taken by whoever allocates next. Admission
//! keeps a safety margin for ordinary and undo allocations so that
//! cleanup work (which reserves with no margin) can always proceed.

use super::extend;
use super::header::{SpaceHeader, SpaceList};
use super::xdes::Xdes;
use super::{AllocType, Space, SpaceState, FSEG_FRAG_LIMIT};
use crate::error::{corruption, Result};
use crate::mtr::Mtr;
use crate::page::EXTENT_SIZE;
use parking_lot::Mutex;
use std::sync::Arc;

/// Extents reserved on a tablespace, given back when dropped
#[derive(Debug)]
pub struct Reservation {
    state: Arc<Mutex<SpaceState>>,
    n_extents: u32,
    released: bool,
}

impl Reservation {
    fn new(state: &Arc<Mutex<SpaceState>>, n_extents: u32) -> Self {
        Reservation {
            state: state.clone(),
            n_extents,
            released: false,
        }
    }

    pub fn n_extents(&self) -> u32 {
        self.n_extents
    }

    /// Give the extents back now rather than at drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.state.lock();
        state.n_reserved_extents = state.n_reserved_extents.saturating_sub(self.n_extents);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Free extents available for reservation: those on FREE plus the ones
/// that `fill_free_list` could still initialize above the free limit, less
/// the descriptor-group extents among them
pub(crate) fn count_free_extents(mtr: &Mtr<'_>, header: &SpaceHeader) -> u32 {
    let size = header.size(mtr);
    let free_limit = header.free_limit(mtr);

    let mut n_free_up = size.saturating_sub(free_limit) / EXTENT_SIZE;
    if n_free_up > 0 {
        n_free_up -= 1;
        n_free_up -= n_free_up / (header.page_size() / EXTENT_SIZE);
    }
    header.list_len(mtr, SpaceList::Free) + n_free_up
}

/// Extents kept back from a reservation of `alloc_type`
pub(crate) fn safety_margin(alloc_type: AllocType, size: u32) -> u32 {
    let n_extents = size / EXTENT_SIZE;
    match alloc_type {
        AllocType::Normal => 2 + n_extents * 2 / 200,
        AllocType::Undo => 1 + n_extents / 200,
        AllocType::Cleaning | AllocType::Blob => 0,
    }
}

/// Free extents required before `n_ext` more can be reserved, given what is
/// already reserved
fn extents_needed(alloc_type: AllocType, size: u32, n_reserved: u32, n_ext: u32) -> u32 {
    let by_count = n_reserved + n_ext;
    match alloc_type {
        AllocType::Normal | AllocType::Undo => {
            by_count.max(safety_margin(alloc_type, size) + n_ext + 1)
        }
        AllocType::Cleaning | AllocType::Blob => by_count,
    }
}

/// Check that a tablespace smaller than one extent has room for `n_pages`
/// more pages, growing it page by page if needed
fn reserve_free_pages(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    size: u32,
    n_pages: u32,
) -> Result<bool> {
    let xdes = Xdes::locate(mtr, header, 0)?;
    let n_used = xdes.n_used(mtr);
    if n_used > size {
        return Err(corruption(
            0,
            format!("{} pages used in a tablespace of {} pages", n_used, size),
            xdes.dump(mtr),
        ));
    }

    if size >= n_used + 2 + n_pages {
        return Ok(true);
    }
    extend::try_extend_data_file_with_pages(mtr, space, header, n_used + n_pages + 1)
}

/// Reserve `n_ext` free extents for a multi-page operation.
///
/// `n_pages` is the number of pages needed when the tablespace is still
/// smaller than one extent; such tablespaces reserve pages, not extents.
/// When the free extents do not cover the request the file is grown once
/// by the shortfall and the check repeated. Returns `None` when the
/// reservation cannot be granted; nothing is reserved then.
pub(crate) fn reserve_free_extents(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    n_ext: u32,
    alloc_type: AllocType,
    n_pages: u32,
) -> Result<Option<Reservation>> {
    mtr.x_lock_space();
    let header = SpaceHeader::get(mtr, space.page_size())?;
    let mut extended = false;

    loop {
        let size = header.size(mtr);

        if size < EXTENT_SIZE && n_pages < FSEG_FRAG_LIMIT {
            return Ok(reserve_free_pages(mtr, space, &header, size, n_pages)?
                .then(|| Reservation::new(space.state, 0)));
        }

        let n_free = count_free_extents(mtr, &header);
        {
            let mut state = space.state.lock();
            let needed = extents_needed(alloc_type, size, state.n_reserved_extents, n_ext);
            if n_free >= needed {
                state.n_reserved_extents += n_ext;
                tracing::debug!(
                    "Reserved {} extents ({:?}), {} now reserved of {} free",
                    n_ext,
                    alloc_type,
                    state.n_reserved_extents,
                    n_free
                );
                return Ok(Some(Reservation::new(space.state, n_ext)));
            }

            if extended {
                tracing::warn!(
                    "Cannot reserve {} extents ({:?}): {} free, {} needed",
                    n_ext,
                    alloc_type,
                    n_free,
                    needed
                );
                return Ok(None);
            }
        }

        // Grow by the shortfall; the extra extents cover the free-limit
        // extent and any descriptor groups the growth spans
        let shortfall = {
            let state = space.state.lock();
            extents_needed(alloc_type, size, state.n_reserved_extents, n_ext) - n_free
        };
        let grow_extents = shortfall + 1 + shortfall / space.extents_per_descriptor() + 1;
        if !extend::try_extend_data_file(mtr, space, &header, grow_extents * EXTENT_SIZE)? {
            tracing::debug!(
                "Reservation of {} extents ({:?}) failed and the tablespace cannot grow",
                n_ext,
                alloc_type
            );
            return Ok(None);
        }
        extended = true;
    }
}

/// Free space in KiB that ordinary allocations could still use
pub(crate) fn available_space_in_free_extents(mtr: &Mtr<'_>, header: &SpaceHeader) -> u64 {
    let size = header.size(mtr);
    if size < EXTENT_SIZE {
        return 0;
    }

    let n_free = count_free_extents(mtr, header);
    let margin = safety_margin(AllocType::Normal, size);
    if margin > n_free {
        return 0;
    }
    (n_free - margin) as u64 * EXTENT_SIZE as u64 * (header.page_size() / 1024) as u64
}
