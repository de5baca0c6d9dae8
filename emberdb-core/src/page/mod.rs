//! Memory-mapped append-only byte pages
//!
//! A page is a fixed-size file named `<index>.bat` mapped read-write. The
//! factory owns the live pages behind a copy-on-write snapshot map, so readers
//! never contend with page creation or truncation.

use crate::{EmberError, Result};
use bytes::Buf;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Page file suffix
const PAGE_SUFFIX: &str = "bat";

/// One memory-mapped page file
pub struct MappedPage {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    size: usize,
}

impl MappedPage {
    /// Open or create the page file at its fixed size and map it shared
    pub fn new(path: PathBuf, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        // the factory is the only creator of this mapping
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path,
            mmap: Mutex::new(mmap),
            size,
        })
    }

    /// Fixed page size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the page at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.size {
            return Err(EmberError::InvalidFormat(format!(
                "page write out of bounds: {} + {} > {}",
                offset,
                data.len(),
                self.size
            )));
        }
        let mut mmap = self.mmap.lock();
        mmap[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the page at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset + len > self.size {
            return Err(EmberError::InvalidFormat(format!(
                "page read out of bounds: {} + {} > {}",
                offset,
                len,
                self.size
            )));
        }
        let mmap = self.mmap.lock();
        Ok(mmap[offset..offset + len].to_vec())
    }

    /// Write a little-endian u32 at `offset`
    pub fn put_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a little-endian u32 at `offset`
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let data = self.read(offset, 4)?;
        let mut cursor = std::io::Cursor::new(data);
        Ok(cursor.get_u32_le())
    }

    /// Write a little-endian u64 at `offset`
    pub fn put_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a little-endian u64 at `offset`
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let data = self.read(offset, 8)?;
        let mut cursor = std::io::Cursor::new(data);
        Ok(cursor.get_u64_le())
    }

    /// Flush dirty ranges to disk
    pub fn sync(&self) -> Result<()> {
        self.mmap.lock().flush()?;
        Ok(())
    }

    /// Page file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Factory managing the mapped pages of one directory
pub struct PageFactory {
    path: PathBuf,
    page_size: usize,
    pages: RwLock<Arc<HashMap<i64, Arc<MappedPage>>>>,
    closed: AtomicBool,
    size: AtomicU64,
}

impl PageFactory {
    /// Open the factory, rebuilding the page map from existing `<index>.bat` files
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        let factory = Self {
            path,
            page_size,
            pages: RwLock::new(Arc::new(HashMap::new())),
            closed: AtomicBool::new(false),
            size: AtomicU64::new(0),
        };
        factory.load_pages()?;
        Ok(factory)
    }

    /// Get the existing page, or create and map a new one
    pub fn acquire(&self, index: i64) -> Result<Arc<MappedPage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::FactoryClosed);
        }
        if let Some(page) = self.get(index) {
            return Ok(page);
        }

        let mut pages = self.pages.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::FactoryClosed);
        }
        if let Some(page) = pages.get(&index) {
            return Ok(page.clone());
        }

        let page = Arc::new(MappedPage::new(self.page_file_name(index), self.page_size)?);
        let mut next = HashMap::clone(&pages);
        next.insert(index, page.clone());
        *pages = Arc::new(next);
        self.size.fetch_add(self.page_size as u64, Ordering::Relaxed);
        Ok(page)
    }

    /// Existing page, if mapped
    pub fn get(&self, index: i64) -> Option<Arc<MappedPage>> {
        self.pages.read().get(&index).cloned()
    }

    /// Close and delete every page with id below `index`
    ///
    /// Failures are logged and skipped; truncation is best-effort.
    pub fn truncate_before(&self, index: i64) {
        let mut pages = self.pages.write();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let expired: Vec<i64> = pages.keys().copied().filter(|id| *id < index).collect();
        if expired.is_empty() {
            return;
        }
        let mut next = HashMap::clone(&pages);
        for id in expired {
            if let Some(page) = next.get(&id) {
                if let Err(e) = page.sync() {
                    warn!(path = %self.path.display(), page = id, error = %e, "sync page failure");
                }
                if let Err(e) = fs::remove_file(self.page_file_name(id)) {
                    warn!(path = %self.path.display(), page = id, error = %e, "remove page failure");
                    continue;
                }
                next.remove(&id);
                self.size.fetch_sub(self.page_size as u64, Ordering::Relaxed);
                info!(path = %self.path.display(), page = id, "removed expired page");
            }
        }
        *pages = Arc::new(next);
    }

    /// Total mapped bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Indexes of the mapped pages, ascending
    pub fn page_indexes(&self) -> Vec<i64> {
        let mut indexes: Vec<i64> = self.pages.read().keys().copied().collect();
        indexes.sort_unstable();
        indexes
    }

    /// Close every page; further acquires fail, close is idempotent
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pages = self.pages.write();
        for (id, page) in pages.iter() {
            if let Err(e) = page.sync() {
                warn!(path = %self.path.display(), page = id, error = %e, "close page failure");
            }
        }
    }

    fn page_file_name(&self, index: i64) -> PathBuf {
        self.path.join(format!("{}.{}", index, PAGE_SUFFIX))
    }

    fn load_pages(&self) -> Result<()> {
        let mut indexes = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(&format!(".{}", PAGE_SUFFIX)) else {
                continue;
            };
            let index: i64 = stem.parse().map_err(|_| {
                EmberError::InvalidFormat(format!("unparseable page file name: {}", name))
            })?;
            indexes.push(index);
        }
        for index in indexes {
            self.acquire(index)?;
        }
        Ok(())
    }
}

impl Drop for PageFactory {
    fn drop(&mut self) {
        self.close();
    }
}
