//! Page storage backends
//!
//! The allocator never talks to a file directly. The buffer pool reads and
//! writes whole pages through the [`Storage`] trait, and file growth goes
//! through [`Storage::extend`].

use crate::error::{Result, SpaceError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Page-addressed backing store for one tablespace
pub trait Storage: Send + Sync {
    fn page_size(&self) -> u32;

    /// Current size in whole pages
    fn size_in_pages(&self) -> Result<u32>;

    /// Read page `page_no` into `buf` (exactly one page long)
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()>;

    /// Write one page image
    fn write_page(&self, page_no: u32, buf: &[u8]) -> Result<()>;

    /// Grow the store to `n_pages` pages; new pages read as zeros.
    ///
    /// Fails with an I/O error when the device cannot hold the new size.
    fn extend(&self, n_pages: u32) -> Result<()>;

    /// Make all completed writes durable
    fn sync(&self) -> Result<()>;
}

fn check_buffer(page_size: u32, buf: &[u8]) -> Result<()> {
    if buf.len() != page_size as usize {
        return Err(SpaceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "Page buffer must be exactly {} bytes, got {}",
                page_size,
                buf.len()
            ),
        )));
    }
    Ok(())
}

/// Disk-backed tablespace file
pub struct SpaceFile {
    file: Mutex<File>,
    path: PathBuf,
    page_size: u32,
}

impl SpaceFile {
    /// Create (or truncate) a tablespace file
    pub fn create<P: AsRef<Path>>(path: P, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(SpaceFile {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            page_size,
        })
    }

    /// Open an existing tablespace file
    pub fn open<P: AsRef<Path>>(path: P, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(SpaceFile {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for SpaceFile {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn size_in_pages(&self) -> Result<u32> {
        let len = self.file.lock().metadata()?.len();
        Ok((len / self.page_size as u64) as u32)
    }

    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(self.page_size, buf)?;

        let mut file = self.file.lock();
        let size = (file.metadata()?.len() / self.page_size as u64) as u32;
        if page_no >= size {
            return Err(SpaceError::PageOutOfRange { page_no, size });
        }

        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, page_no: u32, buf: &[u8]) -> Result<()> {
        check_buffer(self.page_size, buf)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn extend(&self, n_pages: u32) -> Result<()> {
        let file = self.file.lock();
        let new_len = n_pages as u64 * self.page_size as u64;
        if new_len > file.metadata()?.len() {
            file.set_len(new_len)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// In-memory storage, used for temporary tablespaces and tests.
///
/// An optional capacity makes [`Storage::extend`] fail the way a full device
/// would.
pub struct MemoryStorage {
    bytes: Mutex<Vec<u8>>,
    page_size: u32,
    capacity: Mutex<Option<u32>>,
}

impl MemoryStorage {
    pub fn new(page_size: u32) -> Self {
        MemoryStorage {
            bytes: Mutex::new(Vec::new()),
            page_size,
            capacity: Mutex::new(None),
        }
    }

    /// Storage that refuses to grow beyond `max_pages`
    pub fn with_capacity(page_size: u32, max_pages: u32) -> Self {
        let storage = Self::new(page_size);
        *storage.capacity.lock() = Some(max_pages);
        storage
    }

    /// Rebuild storage from a raw image (see [`MemoryStorage::image`])
    pub fn from_image(page_size: u32, image: Vec<u8>) -> Self {
        MemoryStorage {
            bytes: Mutex::new(image),
            page_size,
            capacity: Mutex::new(None),
        }
    }

    pub fn set_capacity(&self, max_pages: Option<u32>) {
        *self.capacity.lock() = max_pages;
    }

    /// Copy of the whole store, as a crash would leave it
    pub fn image(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl Storage for MemoryStorage {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn size_in_pages(&self) -> Result<u32> {
        Ok((self.bytes.lock().len() / self.page_size as usize) as u32)
    }

    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(self.page_size, buf)?;

        let bytes = self.bytes.lock();
        let size = (bytes.len() / self.page_size as usize) as u32;
        if page_no >= size {
            return Err(SpaceError::PageOutOfRange { page_no, size });
        }

        let start = page_no as usize * self.page_size as usize;
        buf.copy_from_slice(&bytes[start..start + self.page_size as usize]);
        Ok(())
    }

    fn write_page(&self, page_no: u32, buf: &[u8]) -> Result<()> {
        check_buffer(self.page_size, buf)?;

        let mut bytes = self.bytes.lock();
        let start = page_no as usize * self.page_size as usize;
        let end = start + self.page_size as usize;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn extend(&self, n_pages: u32) -> Result<()> {
        if let Some(max) = *self.capacity.lock() {
            if n_pages > max {
                return Err(SpaceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("storage full: cannot grow to {} pages (max {})", n_pages, max),
                )));
            }
        }

        let mut bytes = self.bytes.lock();
        let new_len = n_pages as usize * self.page_size as usize;
        if new_len > bytes.len() {
            bytes.resize(new_len, 0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
