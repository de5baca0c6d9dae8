//! Compression building blocks: bit streams, the TSD time-series codec,
//! fixed-width offset indexes and roaring bitmap helpers

mod bitstream;
mod fixed_offset;
mod tsd;

pub use bitstream::{BitReader, BitWriter};
pub use fixed_offset::{FixedOffsetDecoder, FixedOffsetEncoder};
pub use tsd::{TsdDecoder, TsdEncoder};

use crate::{EmberError, Result};
use roaring::RoaringBitmap;

/// Serialise a roaring bitmap
pub fn marshal_bitmap(bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut buf)
        .map_err(|e| EmberError::InvalidFormat(format!("serialize bitmap: {}", e)))?;
    Ok(buf)
}

/// Deserialise a roaring bitmap from the start of `data`
pub fn unmarshal_bitmap(data: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(data)
        .map_err(|e| EmberError::InvalidFormat(format!("deserialize bitmap: {}", e)))
}

/// Intersection of the high 16 bits of series ids present in both bitmaps,
/// used to walk container buckets in metric blocks
pub fn high_keys(bitmap: &RoaringBitmap) -> Vec<u16> {
    let mut keys: Vec<u16> = bitmap.iter().map(|id| (id >> 16) as u16).collect();
    keys.dedup();
    keys
}

/// Ids in `bitmap` whose high 16 bits equal `high`
pub fn low_container(bitmap: &RoaringBitmap, high: u16) -> Vec<u16> {
    let start = (high as u32) << 16;
    let end = start | 0xFFFF;
    bitmap
        .iter()
        .skip_while(|id| *id < start)
        .take_while(|id| *id <= end)
        .map(|id| id as u16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_round_trip() {
        let bitmap: RoaringBitmap = [1u32, 5, 100_000, u32::MAX].into_iter().collect();
        let data = marshal_bitmap(&bitmap).unwrap();
        assert_eq!(unmarshal_bitmap(&data).unwrap(), bitmap);
    }

    #[test]
    fn test_high_low_split() {
        let bitmap: RoaringBitmap = [3u32, 9, 0x0001_0002, 0x0001_0005].into_iter().collect();
        assert_eq!(high_keys(&bitmap), vec![0, 1]);
        assert_eq!(low_container(&bitmap, 0), vec![3, 9]);
        assert_eq!(low_container(&bitmap, 1), vec![2, 5]);
    }
}
