//! Tablespace file growth
//!
//! Growth is never an error: when the policy forbids it, the size cap is
//! reached, or the storage refuses to grow, the functions here return
//! `false` and the caller reports "out of space".

use super::header::SpaceHeader;
use super::{Space, FSP_FREE_ADD};
use crate::config::SpaceKind;
use crate::error::Result;
use crate::mtr::Mtr;
use crate::page::EXTENT_SIZE;
use std::time::{Duration, Instant};

/// First and smallest undo growth step
pub const UNDO_MIN_EXTEND_BYTES: u64 = 16 << 20;

/// Largest undo growth step
pub const UNDO_MAX_EXTEND_BYTES: u64 = 1 << 30;

const UNDO_GROW_WINDOW: Duration = Duration::from_secs(1);
const UNDO_SHRINK_WINDOW: Duration = Duration::from_secs(4);

/// Adaptive growth schedule for undo tablespaces.
///
/// Growth that recurs quickly doubles the next step; growth after a long
/// quiet period halves it.
#[derive(Debug, Clone, Default)]
pub struct UndoGrowth {
    increment_bytes: u64,
    last_extend: Option<Instant>,
}

impl UndoGrowth {
    /// Current step in bytes (0 before the first growth)
    pub fn increment_bytes(&self) -> u64 {
        self.increment_bytes
    }

    /// Record a growth at `now` and return its size in pages
    pub fn next_increment(&mut self, now: Instant, page_size: u32) -> u32 {
        let mut bytes = if self.increment_bytes == 0 {
            UNDO_MIN_EXTEND_BYTES
        } else {
            self.increment_bytes
        };

        if let Some(last) = self.last_extend {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < UNDO_GROW_WINDOW {
                bytes = (bytes * 2).min(UNDO_MAX_EXTEND_BYTES);
            } else if elapsed > UNDO_SHRINK_WINDOW {
                bytes = (bytes / 2).max(UNDO_MIN_EXTEND_BYTES);
            }
        }

        self.increment_bytes = bytes;
        self.last_extend = Some(now);

        let pages = (bytes / page_size as u64) as u32;
        round_up_to_extents(pages).max(EXTENT_SIZE)
    }
}

fn round_up_to_extents(pages: u32) -> u32 {
    pages.div_ceil(EXTENT_SIZE) * EXTENT_SIZE
}

/// Growth step for ordinary tablespaces: one extent while small, then
/// [`FSP_FREE_ADD`] extents (or the configured increment)
pub fn pages_to_extend(page_size: u32, size: u32, increment: Option<u32>) -> u32 {
    let threshold = (32 * EXTENT_SIZE).min(page_size);
    if size < threshold {
        EXTENT_SIZE
    } else {
        increment.unwrap_or(FSP_FREE_ADD * EXTENT_SIZE)
    }
}

/// Grow the file and the header size to `target` pages, capped by
/// `max_size`
fn extend_to(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    target: u32,
) -> Result<bool> {
    let size = header.size(mtr);
    let target = match space.config.max_size {
        Some(max) => target.min(max),
        None => target,
    };

    if target <= size {
        tracing::warn!(
            "Tablespace {} is at its maximum size of {} pages",
            space.config.space_id,
            size
        );
        return Ok(false);
    }

    if let Err(e) = space.storage.extend(target) {
        tracing::warn!(
            "Failed to extend tablespace {} to {} pages: {}",
            space.config.space_id,
            target,
            e
        );
        return Ok(false);
    }

    header.set_size(mtr, target)?;
    space.state.lock().size = target;

    tracing::info!(
        "Extended tablespace {} from {} to {} pages",
        space.config.space_id,
        size,
        target
    );
    Ok(true)
}

/// Grow the tablespace by its policy increment, and by at least
/// `min_increase` pages.
pub(crate) fn try_extend_data_file(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    min_increase: u32,
) -> Result<bool> {
    if !space.config.autoextend {
        tracing::debug!(
            "Tablespace {} does not autoextend",
            space.config.space_id
        );
        return Ok(false);
    }

    let mut size = header.size(mtr);
    if size < EXTENT_SIZE {
        // Fill up the first extent before growing in steps
        if !try_extend_data_file_with_pages(mtr, space, header, EXTENT_SIZE - 1)? {
            return Ok(false);
        }
        size = EXTENT_SIZE;
    }

    let increment = match space.config.kind {
        SpaceKind::Undo => space
            .state
            .lock()
            .undo
            .next_increment(Instant::now(), space.page_size()),
        _ => pages_to_extend(space.page_size(), size, space.config.autoextend_increment),
    };
    let increment = increment.max(round_up_to_extents(min_increase));

    extend_to(mtr, space, header, size.saturating_add(increment))
}

/// Grow a tablespace smaller than one extent so that `page_no` exists
pub(crate) fn try_extend_data_file_with_pages(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    page_no: u32,
) -> Result<bool> {
    if page_no < header.size(mtr) {
        return Ok(true);
    }
    if !space.config.autoextend {
        return Ok(false);
    }
    extend_to(mtr, space, header, page_no + 1)
}
