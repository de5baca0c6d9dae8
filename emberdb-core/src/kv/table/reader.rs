//! Memory-mapped table reader

use super::{table_file_name, FOOTER_SIZE, TABLE_MAGIC};
use crate::encoding::{unmarshal_bitmap, FixedOffsetDecoder};
use crate::types::FileNumber;
use crate::{EmberError, Result};
use bytes::Buf;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Reader over one immutable table file
pub struct TableReader {
    path: PathBuf,
    file_number: FileNumber,
    mmap: Mmap,
    keys: RoaringBitmap,
    offsets: FixedOffsetDecoder,
    entries_end: usize,
}

impl TableReader {
    /// Map and validate the table file `<file_number>.sst` under `dir`
    pub fn open(dir: &Path, file_number: FileNumber) -> Result<Self> {
        let path = table_file_name(dir, file_number);
        let file = File::open(&path)?;
        // the file is immutable once the builder closed it
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(EmberError::CorruptSst(format!(
                "{}: shorter than footer",
                path.display()
            )));
        }
        let footer_start = mmap.len() - FOOTER_SIZE;
        let mut cursor = std::io::Cursor::new(&mmap[footer_start..]);
        let pos_of_offsets = cursor.get_u32_le() as usize;
        let pos_of_keys = cursor.get_u32_le() as usize;
        let crc = cursor.get_u32_le();
        if cursor.get_u64_le() != TABLE_MAGIC {
            return Err(EmberError::CorruptSst(format!(
                "{}: bad magic number",
                path.display()
            )));
        }
        if pos_of_offsets > pos_of_keys || pos_of_keys > footer_start {
            return Err(EmberError::CorruptSst(format!(
                "{}: bad footer positions: offsets {} keys {} footer {}",
                path.display(),
                pos_of_offsets,
                pos_of_keys,
                footer_start
            )));
        }
        let actual = crc32fast::hash(&mmap[pos_of_offsets..footer_start]);
        if actual != crc {
            return Err(EmberError::CorruptSst(format!(
                "{}: index crc mismatch, expected {:08x} got {:08x}",
                path.display(),
                crc,
                actual
            )));
        }

        let offsets = FixedOffsetDecoder::unmarshal(&mmap[pos_of_offsets..pos_of_keys])
            .map_err(|e| EmberError::CorruptSst(format!("{}: {}", path.display(), e)))?;
        let keys = unmarshal_bitmap(&mmap[pos_of_keys..footer_start])
            .map_err(|e| EmberError::CorruptSst(format!("{}: {}", path.display(), e)))?;
        if offsets.size() as u64 != keys.len() {
            return Err(EmberError::CorruptSst(format!(
                "{}: {} offsets for {} keys",
                path.display(),
                offsets.size(),
                keys.len()
            )));
        }

        Ok(Self {
            path,
            file_number,
            mmap,
            keys,
            offsets,
            entries_end: pos_of_offsets,
        })
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File number of this table
    pub fn file_number(&self) -> FileNumber {
        self.file_number
    }

    /// Keys present in this table
    pub fn keys(&self) -> &RoaringBitmap {
        &self.keys
    }

    /// Value for a key; [`EmberError::KeyNotExist`] when absent
    pub fn get(&self, key: u32) -> Result<&[u8]> {
        if !self.keys.contains(key) {
            return Err(EmberError::KeyNotExist);
        }
        // rank counts set bits at or below key, so the block index is rank - 1
        let idx = self.keys.rank(key) as usize - 1;
        self.block(idx)
    }

    /// Iterate key/value pairs in key order
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            reader: self,
            keys: self.keys.iter(),
            idx: 0,
        }
    }

    fn block(&self, idx: usize) -> Result<&[u8]> {
        self.offsets.get_block(idx, &self.mmap[..self.entries_end])
    }
}

/// Iterator over one table's key/value pairs
pub struct TableIterator<'a> {
    reader: &'a TableReader,
    keys: roaring::bitmap::Iter<'a>,
    idx: usize,
}

impl<'a> Iterator for TableIterator<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<(u32, &'a [u8])> {
        let key = self.keys.next()?;
        let idx = self.idx;
        self.idx += 1;
        // index corruption surfaces as an empty value rather than a panic
        let value = self.reader.block(idx).unwrap_or(&[]);
        Some((key, value))
    }
}
