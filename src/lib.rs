//! # tablespace-rs - Page Allocator for Disk-Resident Tablespaces
//!
//! `tablespace-rs` manages free space inside a single paged tablespace file the
//! way a B-tree storage engine needs it:
//!
//! - **Extents** of 64 pages tracked by on-disk descriptors and free lists
//! - **Segments** that grow page by page, first from fragment pages and then
//!   from whole extents, with hints and split direction steering placement
//! - **Reservations** that admit multi-page operations only when the space
//!   can cover them
//! - **Mini-transactions** with page latches and a redo log, so every change
//!   is atomic and replayable after a crash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tablespace_rs::{Direction, Result, SpaceConfig, Tablespace};
//!
//! # fn main() -> Result<()> {
//! let space = Tablespace::create_file("data.ibd", SpaceConfig::default())?;
//!
//! // A segment whose header lives at the start of a fresh page
//! let segment = space.create_segment(None, 38)?.expect("tablespace full");
//!
//! // Grow it towards higher page numbers
//! for _ in 0..100 {
//!     let page = space.alloc_segment_page(segment, 0, Direction::Up)?;
//!     println!("{:?}", page);
//! }
//!
//! // Give everything back
//! space.drop_segment(segment)?;
//! space.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod io;
pub mod mtr;
pub mod page;
pub mod redo;
pub mod tablespace;

pub use crate::allocator::fseg::{AllocatedPage, SegmentInfo};
pub use crate::allocator::header::{SpaceHeaderInfo, SpaceList};
pub use crate::allocator::inode::SegmentRef;
pub use crate::allocator::reserve::Reservation;
pub use crate::allocator::strategy::AllocStrategy;
pub use crate::allocator::validate::ValidationReport;
pub use crate::allocator::xdes::XdesState;
pub use crate::allocator::{AllocType, Direction};
pub use crate::buffer_pool::BufferPoolStats;
pub use crate::config::{CorruptionPolicy, SpaceConfig, SpaceKind};
pub use crate::error::{Result, SpaceError};
pub use crate::io::{MemoryStorage, SpaceFile, Storage};
pub use crate::page::{PageType, EXTENT_SIZE};
pub use crate::redo::RedoLog;
pub use crate::tablespace::{ExtentInfo, SpaceStats, Tablespace};
