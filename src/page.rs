//! Page layout shared by every page in a tablespace
//!
//! Every page starts with a 38-byte FIL header and ends with an 8-byte
//! trailer:
//!
//! ```text
//! 0   checksum (crc32 of bytes 4..size-8)
//! 4   page number
//! 8   previous page (unused by the allocator)
//! 12  next page (unused by the allocator)
//! 16  LSN of the newest modification
//! 24  page type
//! 26  flush LSN (page 0 only)
//! 34  tablespace id
//! 38  page body
//! ...
//! size-8  copy of the checksum
//! size-4  low 32 bits of the LSN
//! ```
//!
//! All multi-byte fields are big-endian.

pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0;
pub const FIL_PAGE_OFFSET: usize = 4;
pub const FIL_PAGE_PREV: usize = 8;
pub const FIL_PAGE_NEXT: usize = 12;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
pub const FIL_PAGE_FILE_FLUSH_LSN: usize = 26;
pub const FIL_PAGE_SPACE_ID: usize = 34;
pub const FIL_PAGE_DATA: usize = 38;
pub const FIL_PAGE_DATA_END: usize = 8;

/// Undefined page number / null link
pub const FIL_NULL: u32 = 0xFFFF_FFFF;

/// Pages per extent
pub const EXTENT_SIZE: u32 = 64;

/// Page types the allocator stamps or recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageType {
    /// Freshly allocated, not yet claimed by a higher layer
    Allocated = 0,
    UndoLog = 2,
    /// Segment inode page
    Inode = 3,
    IbufFreeList = 4,
    /// Insert buffer bitmap (page 1 of every descriptor group)
    IbufBitmap = 5,
    Sys = 6,
    /// Tablespace header page (page 0)
    FspHdr = 8,
    /// Extent descriptor page (first page of later descriptor groups)
    Xdes = 9,
    Blob = 10,
    Index = 17855,
}

impl PageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(PageType::Allocated),
            2 => Some(PageType::UndoLog),
            3 => Some(PageType::Inode),
            4 => Some(PageType::IbufFreeList),
            5 => Some(PageType::IbufBitmap),
            6 => Some(PageType::Sys),
            8 => Some(PageType::FspHdr),
            9 => Some(PageType::Xdes),
            10 => Some(PageType::Blob),
            17855 => Some(PageType::Index),
            _ => None,
        }
    }
}

/// A persistent link: page number plus byte offset within that page.
///
/// These are indices into durable storage, not references: following one
/// means fetching the page and interpreting bytes at `boffset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilAddr {
    pub page_no: u32,
    pub boffset: u16,
}

impl FilAddr {
    pub const NULL: FilAddr = FilAddr {
        page_no: FIL_NULL,
        boffset: 0,
    };

    /// Encoded size in bytes
    pub const SIZE: usize = 6;

    pub fn new(page_no: u32, boffset: u16) -> Self {
        FilAddr { page_no, boffset }
    }

    pub fn is_null(&self) -> bool {
        self.page_no == FIL_NULL
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.page_no.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.boffset.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        FilAddr {
            page_no: read_u32(bytes, 0),
            boffset: read_u16(bytes, 4),
        }
    }
}

pub fn read_u8(buf: &[u8], offset: usize) -> u8 {
    buf[offset]
}

pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// One page image held by the buffer pool
#[derive(Debug, Clone)]
pub struct Page {
    data: Box<[u8]>,

    /// Modified since it was last written to storage
    pub(crate) dirty: bool,
}

impl Page {
    /// Create an all-zero page image
    pub fn new(page_size: u32) -> Self {
        Page {
            data: vec![0u8; page_size as usize].into_boxed_slice(),
            dirty: false,
        }
    }

    /// Wrap raw bytes read from storage
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Page {
            data: bytes.into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn page_no(&self) -> u32 {
        read_u32(&self.data, FIL_PAGE_OFFSET)
    }

    pub fn space_id(&self) -> u32 {
        read_u32(&self.data, FIL_PAGE_SPACE_ID)
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u16(read_u16(&self.data, FIL_PAGE_TYPE))
    }

    pub fn lsn(&self) -> u64 {
        read_u64(&self.data, FIL_PAGE_LSN)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_lsn(&mut self, lsn: u64) {
        self.data[FIL_PAGE_LSN..FIL_PAGE_LSN + 8].copy_from_slice(&lsn.to_be_bytes());
        let end = self.data.len() - 4;
        self.data[end..].copy_from_slice(&(lsn as u32).to_be_bytes());
    }

    /// Zero the page and stamp its identity (`init_file_page`)
    pub(crate) fn init(&mut self, page_no: u32, space_id: u32, page_type: PageType) {
        self.data.fill(0);
        self.data[FIL_PAGE_OFFSET..FIL_PAGE_OFFSET + 4].copy_from_slice(&page_no.to_be_bytes());
        self.data[FIL_PAGE_PREV..FIL_PAGE_PREV + 4].copy_from_slice(&FIL_NULL.to_be_bytes());
        self.data[FIL_PAGE_NEXT..FIL_PAGE_NEXT + 4].copy_from_slice(&FIL_NULL.to_be_bytes());
        self.data[FIL_PAGE_TYPE..FIL_PAGE_TYPE + 2]
            .copy_from_slice(&(page_type as u16).to_be_bytes());
        self.data[FIL_PAGE_SPACE_ID..FIL_PAGE_SPACE_ID + 4]
            .copy_from_slice(&space_id.to_be_bytes());
    }

    /// True for pages that were never written (fresh file space)
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    fn checksum(&self) -> u32 {
        let end = self.data.len() - FIL_PAGE_DATA_END;
        crc32fast::hash(&self.data[FIL_PAGE_OFFSET..end])
    }

    /// Stamp the checksum into the header and trailer before a write
    pub(crate) fn stamp_checksum(&mut self) {
        let crc = self.checksum().to_be_bytes();
        self.data[FIL_PAGE_SPACE_OR_CHKSUM..FIL_PAGE_SPACE_OR_CHKSUM + 4].copy_from_slice(&crc);
        let trailer = self.data.len() - FIL_PAGE_DATA_END;
        self.data[trailer..trailer + 4].copy_from_slice(&crc);
    }

    /// Verify the stored checksum.
    ///
    /// All-zero pages have never been written and are accepted as is.
    pub fn verify_checksum(&self) -> bool {
        if self.is_zeroed() {
            return true;
        }

        let stored = read_u32(&self.data, FIL_PAGE_SPACE_OR_CHKSUM);
        let trailer = read_u32(&self.data, self.data.len() - FIL_PAGE_DATA_END);
        let computed = self.checksum();

        stored == computed && trailer == computed
    }
}
