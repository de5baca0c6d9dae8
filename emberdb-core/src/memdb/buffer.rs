//! Mmap-backed scratch buffer for memdb data points

use crate::page::{MappedPage, PageFactory};
use crate::Result;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Buffer page size; holds many chunks
const BUFFER_PAGE_SIZE: usize = 512 * 1024;

/// Chunk size handed to field stores
pub const CHUNK_SIZE: usize = 128;

const CHUNKS_PER_PAGE: usize = BUFFER_PAGE_SIZE / CHUNK_SIZE;

/// Allocates fixed-size chunks out of memory-mapped pages
///
/// The buffer keeps memdb point data off the heap; releasing the buffer
/// removes its backing files.
pub struct DataPointBuffer {
    dir: PathBuf,
    factory: PageFactory,
    allocated: Mutex<u64>,
}

impl DataPointBuffer {
    /// Create a buffer under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let factory = PageFactory::new(&dir, BUFFER_PAGE_SIZE)?;
        Ok(Self {
            dir,
            factory,
            allocated: Mutex::new(0),
        })
    }

    /// Allocate the next chunk
    pub fn alloc(&self) -> Result<Chunk> {
        let mut allocated = self.allocated.lock();
        let chunk_no = *allocated;
        *allocated += 1;

        let page_index = (chunk_no as usize / CHUNKS_PER_PAGE) as i64;
        let offset = (chunk_no as usize % CHUNKS_PER_PAGE) * CHUNK_SIZE;
        let page = self.factory.acquire(page_index)?;
        Ok(Chunk { page, offset })
    }

    /// Bytes of mapped buffer pages
    pub fn size(&self) -> u64 {
        self.factory.size()
    }

    /// Close the buffer and delete its backing files
    pub fn release(&self) {
        self.factory.close();
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "remove buffer dir failure");
        }
    }
}

/// One fixed-size chunk inside a buffer page
pub struct Chunk {
    page: Arc<MappedPage>,
    offset: usize,
}

impl Chunk {
    /// Write `data` at `at` within the chunk
    pub fn write(&self, at: usize, data: &[u8]) -> Result<()> {
        debug_assert!(at + data.len() <= CHUNK_SIZE);
        self.page.write(self.offset + at, data)
    }

    /// Read `len` bytes at `at` within the chunk
    pub fn read(&self, at: usize, len: usize) -> Result<Vec<u8>> {
        debug_assert!(at + len <= CHUNK_SIZE);
        self.page.read(self.offset + at, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_alloc_and_rw() {
        let dir = TempDir::new().unwrap();
        let buffer = DataPointBuffer::new(dir.path().join("buf")).unwrap();

        let a = buffer.alloc().unwrap();
        let b = buffer.alloc().unwrap();
        a.write(0, b"aaaa").unwrap();
        b.write(0, b"bbbb").unwrap();
        assert_eq!(a.read(0, 4).unwrap(), b"aaaa");
        assert_eq!(b.read(0, 4).unwrap(), b"bbbb");
        assert!(buffer.size() > 0);
    }

    #[test]
    fn test_alloc_crosses_pages() {
        let dir = TempDir::new().unwrap();
        let buffer = DataPointBuffer::new(dir.path().join("buf")).unwrap();
        let chunks: Vec<Chunk> = (0..CHUNKS_PER_PAGE + 2)
            .map(|_| buffer.alloc().unwrap())
            .collect();
        chunks.last().unwrap().write(0, b"tail").unwrap();
        assert_eq!(chunks.last().unwrap().read(0, 4).unwrap(), b"tail");
        assert_eq!(buffer.size() as usize, 2 * BUFFER_PAGE_SIZE);
    }

    #[test]
    fn test_release_removes_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buf");
        let buffer = DataPointBuffer::new(&path).unwrap();
        buffer.alloc().unwrap();
        buffer.release();
        assert!(!path.exists());
    }
}
