//! Tablespace handle
//!
//! [`Tablespace`] ties a storage backend, its buffer pool and redo log to the
//! allocator. Every public operation runs in its own mini-transaction:
//! modifying operations hold the tablespace latch exclusively, inspection
//! takes it shared. The handle is `Send + Sync`; share it with `Arc`.
//!
//! ```rust,no_run
//! use tablespace_rs::{Direction, SpaceConfig, Tablespace};
//!
//! # fn main() -> tablespace_rs::Result<()> {
//! let space = Tablespace::create_in_memory(SpaceConfig::default())?;
//! let segment = space.create_segment(None, 38)?.expect("space for a segment");
//! let page = space.alloc_segment_page(segment, 0, Direction::Up)?;
//! println!("{:?}", page);
//! # Ok(())
//! # }
//! ```

use crate::allocator::fseg::{self, AllocatedPage, SegmentInfo};
use crate::allocator::header::{SpaceHeader, SpaceHeaderInfo, SpaceList};
use crate::allocator::inode::SegmentRef;
use crate::allocator::reserve::{self, Reservation};
use crate::allocator::validate::{self, ValidationReport};
use crate::allocator::xdes::{BitKind, Xdes, XdesState};
use crate::allocator::{flst, fsp, AllocType, Direction, Space, SpaceState};
use crate::buffer_pool::{BufferPool, BufferPoolStats};
use crate::config::{CorruptionPolicy, SpaceConfig};
use crate::error::{corruption, Result, SpaceError};
use crate::io::{MemoryStorage, SpaceFile, Storage};
use crate::mtr::{LogMode, Mtr};
use crate::page::{Page, PageType, EXTENT_SIZE};
use crate::redo::{RedoLog, RedoRecord};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tablespace statistics
#[derive(Debug, Clone, Serialize)]
pub struct SpaceStats {
    pub space_id: u32,
    pub page_size: u32,
    pub size: u32,
    pub free_limit: u32,
    pub frag_n_used: u32,
    pub free_extents: u32,
    pub free_frag_extents: u32,
    pub full_frag_extents: u32,
    pub inode_pages_full: u32,
    pub inode_pages_free: u32,
    pub next_segment_id: u64,
    /// Extents currently promised to in-flight operations
    pub n_reserved_extents: u32,
    pub available_kib: u64,
    pub buffer_pool: BufferPoolStats,
}

/// One extent descriptor, decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentInfo {
    pub first_page: u32,
    pub state: XdesState,
    pub segment_id: u64,
    pub n_used: u32,
    /// Page offsets within the extent that are free
    pub free_offsets: Vec<u32>,
}

/// Redo log file kept next to a tablespace file
pub fn redo_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".redo");
    PathBuf::from(name)
}

pub struct Tablespace {
    config: SpaceConfig,
    storage: Arc<dyn Storage>,
    pool: BufferPool,
    redo: Arc<RedoLog>,
    latch: Arc<RwLock<()>>,
    state: Arc<Mutex<SpaceState>>,
}

impl Tablespace {
    fn with_parts(config: SpaceConfig, storage: Arc<dyn Storage>, redo: Arc<RedoLog>) -> Result<Self> {
        config.validate()?;
        if storage.page_size() != config.page_size {
            return Err(SpaceError::InvalidConfig(format!(
                "storage page size {} does not match configured page size {}",
                storage.page_size(),
                config.page_size
            )));
        }

        let pool = BufferPool::new(
            storage.clone(),
            redo.clone(),
            config.buffer_pool_pages,
            config.verify_checksums,
        );

        Ok(Tablespace {
            config,
            storage,
            pool,
            redo,
            latch: Arc::new(RwLock::new(())),
            state: Arc::new(Mutex::new(SpaceState::default())),
        })
    }

    /// Lay out a new tablespace of `config.initial_size` pages on `storage`
    pub fn create(config: SpaceConfig, storage: Arc<dyn Storage>, redo: Arc<RedoLog>) -> Result<Self> {
        let space = Self::with_parts(config, storage, redo)?;
        let initial_size = space.config.initial_size;

        if space.storage.size_in_pages()? < initial_size {
            space.storage.extend(initial_size)?;
        }
        space.modify(|mtr, s| fsp::init(mtr, s, initial_size))?;

        tracing::info!(
            "Created tablespace {} with {} pages of {} bytes",
            space.config.space_id,
            initial_size,
            space.config.page_size
        );
        Ok(space)
    }

    /// New tablespace backed by memory only
    pub fn create_in_memory(config: SpaceConfig) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::new(config.page_size));
        Self::create(config, storage, Arc::new(RedoLog::in_memory()))
    }

    /// New tablespace in a file at `path`, with its redo log at
    /// `<path>.redo`. Existing files are truncated.
    pub fn create_file<P: AsRef<Path>>(path: P, config: SpaceConfig) -> Result<Self> {
        let path = path.as_ref();
        let log_path = redo_path(path);
        match std::fs::remove_file(&log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let storage = Arc::new(SpaceFile::create(path, config.page_size)?);
        let redo = Arc::new(RedoLog::open(&log_path)?);
        Self::create(config, storage, redo)
    }

    /// Open an existing tablespace, checking page 0 against `config`
    pub fn open(config: SpaceConfig, storage: Arc<dyn Storage>, redo: Arc<RedoLog>) -> Result<Self> {
        let space = Self::with_parts(config, storage, redo)?;

        let storage_pages = space.storage.size_in_pages()?;
        if storage_pages == 0 {
            return Err(SpaceError::PageOutOfRange {
                page_no: 0,
                size: 0,
            });
        }

        let frame = space.pool.fetch(0)?;
        let info = {
            let page = frame.read();
            let info = SpaceHeaderInfo::from_page_bytes(page.data());

            if info.space_id != space.config.space_id {
                return Err(SpaceError::SpaceIdMismatch {
                    expected: space.config.space_id,
                    found: info.space_id,
                });
            }
            if info.page_size != Some(space.config.page_size) {
                return Err(SpaceError::InvalidPageSize(info.page_size.unwrap_or(0)));
            }
            if !info.limits_consistent() || info.size > storage_pages {
                let err = corruption(
                    0,
                    format!(
                        "header size {} and free limit {} do not fit {} stored pages",
                        info.size, info.free_limit, storage_pages
                    ),
                    page.data(),
                );
                return Err(space.guard(err));
            }
            info
        };
        drop(frame);

        {
            let mut state = space.state.lock();
            state.size = info.size;
            state.free_limit = info.free_limit;
            state.free_len = info.free_len;
        }

        tracing::info!(
            "Opened tablespace {}: {} pages, free limit {}",
            info.space_id,
            info.size,
            info.free_limit
        );
        Ok(space)
    }

    /// Open the tablespace file at `path` and its redo log
    pub fn open_file<P: AsRef<Path>>(path: P, config: SpaceConfig) -> Result<Self> {
        let path = path.as_ref();
        let storage = Arc::new(SpaceFile::open(path, config.page_size)?);
        let redo = Arc::new(RedoLog::open(redo_path(path))?);
        Self::open(config, storage, redo)
    }

    /// Replay `redo` onto `storage`, then open.
    ///
    /// A batch is applied to a page only if it is newer than the page LSN,
    /// so replaying the same log twice is harmless.
    pub fn recover(config: SpaceConfig, storage: Arc<dyn Storage>, redo: Arc<RedoLog>) -> Result<Self> {
        config.validate()?;
        let page_size = config.page_size;
        let batches = RedoLog::parse(&redo.contents());

        let mut stored = storage.size_in_pages()?;
        let mut pages: BTreeMap<u32, Page> = BTreeMap::new();
        let mut changed = BTreeSet::new();
        let mut applied = 0;

        for batch in batches.iter().filter(|b| b.space_id == config.space_id) {
            let mut newer: HashMap<u32, bool> = HashMap::new();

            for record in &batch.records {
                let page_no = record.page_no();
                if !pages.contains_key(&page_no) {
                    let page = if page_no < stored {
                        let mut buf = vec![0u8; page_size as usize];
                        storage.read_page(page_no, &mut buf)?;
                        Page::from_bytes(buf)
                    } else {
                        Page::new(page_size)
                    };
                    pages.insert(page_no, page);
                }
                let Some(page) = pages.get_mut(&page_no) else {
                    continue;
                };

                let apply = *newer
                    .entry(page_no)
                    .or_insert_with(|| page.lsn() < batch.lsn);
                if !apply {
                    continue;
                }

                match record {
                    RedoRecord::InitPage { page_type, .. } => {
                        let Some(page_type) = PageType::from_u16(*page_type) else {
                            return Err(corruption(
                                page_no,
                                format!("redo record with unknown page type {}", page_type),
                                &batch.lsn.to_be_bytes(),
                            ));
                        };
                        page.init(page_no, config.space_id, page_type);
                    }
                    RedoRecord::Write { offset, bytes, .. } => {
                        let start = *offset as usize;
                        let end = start + bytes.len();
                        if end > page.size() {
                            return Err(corruption(
                                page_no,
                                format!("redo write {}..{} past the page end", start, end),
                                bytes,
                            ));
                        }
                        page.data_mut()[start..end].copy_from_slice(bytes);
                    }
                }
            }

            for (page_no, apply) in newer {
                if apply {
                    if let Some(page) = pages.get_mut(&page_no) {
                        page.set_lsn(batch.lsn);
                    }
                    changed.insert(page_no);
                }
            }
            applied += 1;
        }

        // Grow storage to cover replayed pages and the recovered size
        let mut needed = changed.iter().next_back().map_or(0, |&p| p + 1);
        if let Some(page0) = pages.get(&0) {
            needed = needed.max(SpaceHeaderInfo::from_page_bytes(page0.data()).size);
        }
        if needed > stored {
            storage.extend(needed)?;
            stored = needed;
        }

        for page_no in &changed {
            if let Some(page) = pages.get_mut(page_no) {
                page.stamp_checksum();
                storage.write_page(*page_no, page.data())?;
            }
        }
        storage.sync()?;

        tracing::info!(
            "Recovered tablespace {}: {} batches replayed, {} pages rewritten, {} pages stored",
            config.space_id,
            applied,
            changed.len(),
            stored
        );
        Self::open(config, storage, redo)
    }

    fn space(&self) -> Space<'_> {
        Space {
            config: &self.config,
            storage: self.storage.as_ref(),
            state: &self.state,
        }
    }

    fn mtr(&self) -> Mtr<'_> {
        let log_mode = if self.config.is_temporary() {
            LogMode::NoRedo
        } else {
            LogMode::Redo
        };
        Mtr::start(
            self.config.space_id,
            &self.pool,
            &self.redo,
            &self.latch,
            log_mode,
        )
    }

    /// Apply the corruption policy to an error on its way out
    fn guard(&self, err: SpaceError) -> SpaceError {
        if err.is_corruption() && self.config.on_corruption == CorruptionPolicy::Abort {
            tracing::error!(
                "Aborting on corruption in tablespace {}: {}",
                self.config.space_id,
                err
            );
            std::process::abort();
        }
        err
    }

    fn refresh_state(&self, mtr: &mut Mtr<'_>) -> Result<()> {
        let header = SpaceHeader::get(mtr, self.config.page_size)?;
        let mut state = self.state.lock();
        state.size = header.size(mtr);
        state.free_limit = header.free_limit(mtr);
        state.free_len = header.list_len(mtr, SpaceList::Free);
        Ok(())
    }

    /// Run `f` in a modifying mini-transaction and commit it
    fn modify<T>(&self, f: impl FnOnce(&mut Mtr<'_>, &Space<'_>) -> Result<T>) -> Result<T> {
        let space = self.space();
        let mut mtr = self.mtr();
        mtr.x_lock_space();

        let value = match f(&mut mtr, &space) {
            Ok(value) => value,
            Err(e) => return Err(self.guard(e)),
        };
        self.refresh_state(&mut mtr).map_err(|e| self.guard(e))?;
        mtr.commit()?;
        Ok(value)
    }

    /// Run `f` in a read-only mini-transaction
    fn read<T>(&self, f: impl FnOnce(&mut Mtr<'_>, &Space<'_>) -> Result<T>) -> Result<T> {
        let space = self.space();
        let mut mtr = self.mtr();
        mtr.s_lock_space();

        let value = f(&mut mtr, &space).map_err(|e| self.guard(e))?;
        mtr.commit()?;
        Ok(value)
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn space_id(&self) -> u32 {
        self.config.space_id
    }

    /// Size in pages, as of the last committed change
    pub fn size(&self) -> u32 {
        self.state.lock().size
    }

    pub fn free_limit(&self) -> u32 {
        self.state.lock().free_limit
    }

    /// Allocate a single fragment page outside any segment
    pub fn alloc_page(&self, hint: u32) -> Result<Option<u32>> {
        self.modify(|mtr, s| {
            Ok(fsp::alloc_free_page(mtr, s, hint, PageType::Allocated)?.map(|b| b.page_no()))
        })
    }

    /// Free a page obtained from [`Tablespace::alloc_page`]
    pub fn free_page(&self, page_no: u32) -> Result<()> {
        self.modify(|mtr, s| fsp::free_page(mtr, s, page_no))
    }

    /// Reserve free extents ahead of a multi-page operation. The extents are
    /// released when the returned guard is dropped.
    pub fn reserve_free_extents(
        &self,
        n_extents: u32,
        alloc_type: AllocType,
        n_pages: u32,
    ) -> Result<Option<Reservation>> {
        self.modify(|mtr, s| reserve::reserve_free_extents(mtr, s, n_extents, alloc_type, n_pages))
    }

    /// Create a segment. The 10-byte segment header is written at `offset`
    /// of `header_page`, or of a newly allocated page when `None`.
    pub fn create_segment(&self, header_page: Option<u32>, offset: u16) -> Result<Option<SegmentRef>> {
        self.modify(|mtr, s| fseg::create(mtr, s, header_page, offset))
    }

    /// Allocate a page for a segment, reserving two extents for the call
    pub fn alloc_segment_page(
        &self,
        segment: SegmentRef,
        hint: u32,
        direction: Direction,
    ) -> Result<Option<AllocatedPage>> {
        self.modify(|mtr, s| fseg::alloc_page(mtr, s, segment, hint, direction, false))
    }

    /// Allocate a page for a segment under a reservation the caller holds
    pub fn alloc_segment_page_reserved(
        &self,
        segment: SegmentRef,
        hint: u32,
        direction: Direction,
        _reservation: &Reservation,
    ) -> Result<Option<AllocatedPage>> {
        self.modify(|mtr, s| fseg::alloc_page(mtr, s, segment, hint, direction, true))
    }

    pub fn free_segment_page(&self, segment: SegmentRef, page_no: u32) -> Result<()> {
        self.modify(|mtr, s| fseg::free_page(mtr, s, segment, page_no))
    }

    /// Free one extent or fragment page of a segment; `true` once the whole
    /// segment is gone
    pub fn free_step(&self, segment: SegmentRef) -> Result<bool> {
        self.modify(|mtr, s| fseg::free_step(mtr, s, segment))
    }

    /// Free everything except the segment header page; `true` when only
    /// that page remains
    pub fn free_step_not_header(&self, segment: SegmentRef) -> Result<bool> {
        self.modify(|mtr, s| fseg::free_step_not_header(mtr, s, segment))
    }

    /// Free a whole segment, one mini-transaction per step
    pub fn drop_segment(&self, segment: SegmentRef) -> Result<u32> {
        let mut steps = 0;
        loop {
            steps += 1;
            if self.free_step(segment)? {
                tracing::debug!("Dropped segment at {:?} in {} steps", segment, steps);
                return Ok(steps);
            }
        }
    }

    /// `(reserved, used)` pages of a segment
    pub fn n_reserved_pages(&self, segment: SegmentRef) -> Result<(u32, u32)> {
        self.read(|mtr, s| fseg::n_reserved_pages(mtr, s, segment))
    }

    pub fn n_frag_pages(&self, segment: SegmentRef) -> Result<u32> {
        self.read(|mtr, s| fseg::n_frag_pages(mtr, s, segment))
    }

    pub fn segment_info(&self, segment: SegmentRef) -> Result<SegmentInfo> {
        self.read(|mtr, s| fseg::segment_info(mtr, s, segment))
    }

    /// First pages of every extent a segment owns, FULL then NOT_FULL then
    /// FREE
    pub fn segment_extents(&self, segment: SegmentRef) -> Result<Vec<u32>> {
        let info = self.segment_info(segment)?;
        Ok(info
            .full
            .into_iter()
            .chain(info.not_full)
            .chain(info.free)
            .collect())
    }

    pub fn page_is_free(&self, page_no: u32) -> Result<bool> {
        self.read(|mtr, s| fseg::page_is_free(mtr, s, page_no))
    }

    /// Free space in KiB usable by ordinary allocations
    pub fn available_space_in_free_extents(&self) -> Result<u64> {
        self.read(|mtr, s| {
            let header = SpaceHeader::get(mtr, s.page_size())?;
            Ok(reserve::available_space_in_free_extents(mtr, &header))
        })
    }

    /// Descriptor of the extent containing `page_no`, if initialized
    pub fn describe_extent(&self, page_no: u32) -> Result<Option<ExtentInfo>> {
        self.read(|mtr, s| {
            let header = SpaceHeader::get(mtr, s.page_size())?;
            let Some(xdes) = Xdes::lookup(mtr, &header, page_no)? else {
                return Ok(None);
            };
            Ok(Some(ExtentInfo {
                first_page: xdes.first_page,
                state: xdes.state(mtr)?,
                segment_id: xdes.segment_id(mtr),
                n_used: xdes.n_used(mtr),
                free_offsets: (0..EXTENT_SIZE)
                    .filter(|&off| xdes.get_bit(mtr, BitKind::Free, off))
                    .collect(),
            }))
        })
    }

    /// First pages of the extents on an extent list, or the page numbers of
    /// an inode page list
    pub fn space_list_extents(&self, list: SpaceList) -> Result<Vec<u32>> {
        self.read(|mtr, s| {
            let header = SpaceHeader::get(mtr, s.page_size())?;
            let nodes = flst::collect(mtr, header.list(list))?;
            if !list.holds_extents() {
                return Ok(nodes.into_iter().map(|node| node.page_no).collect());
            }
            nodes
                .into_iter()
                .map(|node| Xdes::from_node(mtr, s.page_size(), node).map(|x| x.first_page))
                .collect()
        })
    }

    /// Decoded header fields
    pub fn header_info(&self) -> Result<SpaceHeaderInfo> {
        self.read(|mtr, s| Ok(SpaceHeader::get(mtr, s.page_size())?.info(mtr)))
    }

    pub fn stats(&self) -> Result<SpaceStats> {
        let info = self.header_info()?;
        let available_kib = self.available_space_in_free_extents()?;
        Ok(SpaceStats {
            space_id: info.space_id,
            page_size: info.page_size.unwrap_or(self.config.page_size),
            size: info.size,
            free_limit: info.free_limit,
            frag_n_used: info.frag_n_used,
            free_extents: info.free_len,
            free_frag_extents: info.free_frag_len,
            full_frag_extents: info.full_frag_len,
            inode_pages_full: info.seg_inodes_full_len,
            inode_pages_free: info.seg_inodes_free_len,
            next_segment_id: info.next_segment_id,
            n_reserved_extents: self.state.lock().n_reserved_extents,
            available_kib,
            buffer_pool: self.pool.stats(),
        })
    }

    /// Check every allocator list against the extent descriptors.
    ///
    /// Corruption is reported in the result, never through the abort policy.
    pub fn validate(&self) -> Result<ValidationReport> {
        let space = self.space();
        let mut mtr = self.mtr();
        mtr.s_lock_space();
        let report = validate::validate(&mut mtr, &space)?;
        mtr.commit()?;
        Ok(report)
    }

    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Write every dirty page to storage
    pub fn flush(&self) -> Result<()> {
        let _latch = self.latch.read();
        self.pool.flush_all()
    }

    /// Make every committed mini-transaction durable in the redo log
    pub fn flush_log(&self) -> Result<()> {
        self.redo.flush_to(self.redo.current_lsn())
    }

    /// Copy of the redo log written so far
    pub fn redo_contents(&self) -> Vec<u8> {
        self.redo.contents()
    }

    #[cfg(test)]
    fn cached_free_len(&self) -> u32 {
        self.state.lock().free_len
    }
}
