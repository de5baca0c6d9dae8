//! Immutable sorted-key table files
//!
//! ```text
//! [ entries_block | fixed_offsets_block | keys_bitmap | footer ]
//! footer = [ pos_of_offsets:u32_le | pos_of_keys:u32_le | crc32:u32_le | magic:u64_le ]
//! ```
//!
//! Values are uninterpreted byte blocks keyed by `u32`; the keys bitmap plus
//! the fixed-offset index resolve a key to its block by rank.

mod builder;
mod cache;
mod merged;
mod reader;

pub use builder::{BuiltTable, TableBuilder};
pub use cache::TableCache;
pub use merged::MergedIterator;
pub use reader::{TableIterator, TableReader};

use crate::types::FileNumber;
use std::path::{Path, PathBuf};

/// Table file magic number ("EMBERSST")
pub const TABLE_MAGIC: u64 = 0x454D_4245_5253_5354;

/// Footer size: two positions, crc32, magic
pub const FOOTER_SIZE: usize = 4 + 4 + 4 + 8;

/// Table file name for a file number
pub fn table_file_name(dir: &Path, file_number: FileNumber) -> PathBuf {
    dir.join(format!("{:06}.sst", file_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmberError;
    use tempfile::TempDir;

    #[test]
    fn test_build_then_read() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 7).unwrap();
        builder.add(1, b"one").unwrap();
        builder.add(10, b"ten").unwrap();
        builder.add(1000, b"thousand").unwrap();
        let meta = builder.close().unwrap();
        assert_eq!(meta.file_number, 7);
        assert_eq!(meta.min_key, 1);
        assert_eq!(meta.max_key, 1000);

        let reader = TableReader::open(dir.path(), 7).unwrap();
        assert_eq!(reader.get(1).unwrap(), b"one");
        assert_eq!(reader.get(10).unwrap(), b"ten");
        assert_eq!(reader.get(1000).unwrap(), b"thousand");
        assert!(matches!(reader.get(2), Err(EmberError::KeyNotExist)));
    }

    #[test]
    fn test_get_consistent_with_iterator() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 1).unwrap();
        let keys: Vec<u32> = (0..500).map(|i| i * 7).collect();
        for key in &keys {
            builder.add(*key, format!("value-{}", key).as_bytes()).unwrap();
        }
        builder.close().unwrap();

        let reader = TableReader::open(dir.path(), 1).unwrap();
        let mut seen = 0;
        for (key, value) in reader.iter() {
            assert_eq!(reader.get(key).unwrap(), value);
            seen += 1;
        }
        assert_eq!(seen, keys.len());
    }

    #[test]
    fn test_out_of_order_key_rejected() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 2).unwrap();
        builder.add(5, b"five").unwrap();
        assert!(matches!(
            builder.add(5, b"again"),
            Err(EmberError::KeyOutOfOrder { .. })
        ));
        assert!(matches!(
            builder.add(4, b"four"),
            Err(EmberError::KeyOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_corrupt_magic_fails_open() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 3).unwrap();
        builder.add(1, b"x").unwrap();
        builder.close().unwrap();

        let path = table_file_name(dir.path(), 3);
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 1] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert!(matches!(
            TableReader::open(dir.path(), 3),
            Err(EmberError::CorruptSst(_))
        ));
    }

    #[test]
    fn test_corrupt_index_crc_fails_open() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 4).unwrap();
        builder.add(1, b"abc").unwrap();
        builder.add(9, b"def").unwrap();
        let meta = builder.close().unwrap();
        assert!(meta.size > 0);

        let path = table_file_name(dir.path(), 4);
        let mut data = std::fs::read(&path).unwrap();
        // flip a bit inside the offsets block
        data[7] ^= 0x01;
        std::fs::write(&path, data).unwrap();

        assert!(TableReader::open(dir.path(), 4).is_err());
    }

    #[test]
    fn test_merged_iterator_orders_keys() {
        let dir = TempDir::new().unwrap();
        let mut b1 = TableBuilder::new(dir.path(), 1).unwrap();
        b1.add(1, b"a1").unwrap();
        b1.add(3, b"a3").unwrap();
        b1.close().unwrap();
        let mut b2 = TableBuilder::new(dir.path(), 2).unwrap();
        b2.add(2, b"b2").unwrap();
        b2.add(3, b"b3").unwrap();
        b2.close().unwrap();

        let r1 = TableReader::open(dir.path(), 1).unwrap();
        let r2 = TableReader::open(dir.path(), 2).unwrap();
        let merged: Vec<(u32, Vec<u8>)> = MergedIterator::new(vec![r1.iter(), r2.iter()])
            .map(|(key, value)| (key, value.to_vec()))
            .collect();
        assert_eq!(
            merged,
            vec![
                (1, b"a1".to_vec()),
                (2, b"b2".to_vec()),
                (3, b"a3".to_vec()),
                (3, b"b3".to_vec()),
            ]
        );
    }
}
