//! Table builder writing sorted keys to disk

use super::{table_file_name, TABLE_MAGIC};
use crate::encoding::{marshal_bitmap, FixedOffsetEncoder};
use crate::types::FileNumber;
use crate::{EmberError, Result};
use bytes::BufMut;
use roaring::RoaringBitmap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Metadata of a finished table file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltTable {
    pub file_number: FileNumber,
    pub min_key: u32,
    pub max_key: u32,
    pub size: u64,
    pub count: u64,
}

/// Table builder; keys must arrive in strictly ascending order
pub struct TableBuilder {
    path: PathBuf,
    file_number: FileNumber,
    file: BufWriter<File>,
    keys: RoaringBitmap,
    offsets: FixedOffsetEncoder,
    entries_size: u64,
    last_key: Option<u32>,
}

impl TableBuilder {
    /// Create the table file `<file_number>.sst` under `dir`
    pub fn new(dir: impl Into<PathBuf>, file_number: FileNumber) -> Result<Self> {
        let path = table_file_name(&dir.into(), file_number);
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            file_number,
            file,
            keys: RoaringBitmap::new(),
            offsets: FixedOffsetEncoder::new(),
            entries_size: 0,
            last_key: None,
        })
    }

    /// File number this builder writes
    pub fn file_number(&self) -> FileNumber {
        self.file_number
    }

    /// Number of keys added so far
    pub fn count(&self) -> u64 {
        self.keys.len()
    }

    /// Bytes of entry data written so far
    pub fn size(&self) -> u64 {
        self.entries_size
    }

    /// Smallest key added
    pub fn min_key(&self) -> u32 {
        self.keys.min().unwrap_or(0)
    }

    /// Largest key added
    pub fn max_key(&self) -> u32 {
        self.keys.max().unwrap_or(0)
    }

    /// Append one key/value entry
    pub fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(EmberError::KeyOutOfOrder { key, last });
            }
        }
        self.offsets.add(self.entries_size as u32);
        self.file.write_all(value)?;
        self.entries_size += value.len() as u64;
        self.keys.insert(key);
        self.last_key = Some(key);
        Ok(())
    }

    /// Finalise the file: offsets block, keys bitmap, footer
    pub fn close(mut self) -> Result<BuiltTable> {
        let pos_of_offsets = self.entries_size as u32;
        let offsets_block = self.offsets.marshal();
        let keys_block = marshal_bitmap(&self.keys)?;
        let pos_of_keys = pos_of_offsets + offsets_block.len() as u32;

        // crc covers both index blocks
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&offsets_block);
        hasher.update(&keys_block);

        let mut tail = Vec::with_capacity(offsets_block.len() + keys_block.len() + 20);
        tail.extend_from_slice(&offsets_block);
        tail.extend_from_slice(&keys_block);
        tail.put_u32_le(pos_of_offsets);
        tail.put_u32_le(pos_of_keys);
        tail.put_u32_le(hasher.finalize());
        tail.put_u64_le(TABLE_MAGIC);

        self.file.write_all(&tail)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(BuiltTable {
            file_number: self.file_number,
            min_key: self.min_key(),
            max_key: self.max_key(),
            size: self.entries_size + tail.len() as u64,
            count: self.keys.len(),
        })
    }

    /// Drop the partially written file
    pub fn abandon(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
