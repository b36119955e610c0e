//! File space management
//!
//! The allocator keeps all of its bookkeeping inside the tablespace itself:
//!
//! - page 0 holds the tablespace header ([`header`]) followed by the first
//!   array of extent descriptors ([`xdes`])
//! - every `page_size`-th page is another descriptor page, followed by an
//!   insert-buffer bitmap page
//! - segment inodes ([`inode`]) live in dedicated inode pages
//!
//! Extents move between on-disk doubly linked lists ([`flst`]). The
//! tablespace layer ([`fsp`]) hands out single fragment pages and whole
//! extents; the segment layer ([`fseg`]) builds on it with the ordered
//! strategy cascade in [`strategy`]. Multi-page operations are admitted by
//! [`reserve`], and [`validate`] checks every list against the descriptors.
//!
//! Every function here takes the caller's mini-transaction and a [`Space`]
//! context. Structural changes must run with the tablespace latch held
//! exclusively.

pub mod extend;
pub mod flst;
pub mod fseg;
pub mod fsp;
pub mod header;
pub mod inode;
pub mod reserve;
pub mod strategy;
pub mod validate;
pub mod xdes;

use crate::config::SpaceConfig;
use crate::io::Storage;
use extend::UndoGrowth;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fragment page slots per segment inode
pub const FSEG_FRAG_LIMIT: u32 = 32;

/// Ordinary extents added to FREE per `fill_free_list` call
pub const FSP_FREE_ADD: u32 = 4;

/// A segment must reserve this many extents before it prefills its own
/// free list
pub const FSEG_FREE_LIST_LIMIT: u32 = 40;

/// Extents claimed by one segment free-list prefill
pub const FSEG_FREE_LIST_MAX_LEN: u32 = 4;

/// Pages of a descriptor-group first extent taken by the descriptor page and
/// the insert-buffer bitmap page
pub const XDES_FRAG_N_USED: u32 = 2;

/// Page offset of the insert-buffer bitmap within a descriptor group
pub const FSP_IBUF_BITMAP_OFFSET: u32 = 1;

/// Preferred growth direction of a segment (index page splits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    NoDir,
}

/// Purpose of a reservation, which decides the safety margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocType {
    /// Ordinary growth; keeps the largest margin
    Normal,
    /// Undo logging; space is given back eventually
    Undo,
    /// Purge and cleanup; no margin
    Cleaning,
    /// Large externally stored values; no margin
    Blob,
}

/// In-memory counters owned by a tablespace handle.
///
/// `size`, `free_limit` and `free_len` mirror the header on page 0 and are
/// refreshed after every modifying mini-transaction. `n_reserved_extents` and
/// the undo growth schedule exist only in memory.
#[derive(Debug, Default)]
pub struct SpaceState {
    pub size: u32,
    pub free_limit: u32,
    pub free_len: u32,
    pub n_reserved_extents: u32,
    pub undo: UndoGrowth,
}

/// Everything an allocator call needs besides the mini-transaction
pub(crate) struct Space<'a> {
    pub(crate) config: &'a SpaceConfig,
    pub(crate) storage: &'a dyn Storage,
    pub(crate) state: &'a Arc<Mutex<SpaceState>>,
}

impl Space<'_> {
    pub(crate) fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Extents described by one descriptor page
    pub(crate) fn extents_per_descriptor(&self) -> u32 {
        self.config.page_size / crate::page::EXTENT_SIZE
    }
}
