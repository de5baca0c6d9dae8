//! Fixed-width offset index
//!
//! Stores monotone entry start offsets as a base value plus fixed-width
//! deltas, so lookups are O(1) on the mmap'd block:
//!
//! ```text
//! [ count:u32_le | base:u32_le | width:u8 | count * width delta bytes ]
//! ```

use crate::{EmberError, Result};
use bytes::{Buf, BufMut};

/// Fixed-offset index encoder
#[derive(Debug, Default)]
pub struct FixedOffsetEncoder {
    offsets: Vec<u32>,
}

impl FixedOffsetEncoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the next entry start offset
    pub fn add(&mut self, offset: u32) {
        self.offsets.push(offset);
    }

    /// Number of offsets added
    pub fn size(&self) -> usize {
        self.offsets.len()
    }

    /// Reset for reuse
    pub fn reset(&mut self) {
        self.offsets.clear();
    }

    /// Serialise the index
    pub fn marshal(&self) -> Vec<u8> {
        let base = self.offsets.first().copied().unwrap_or(0);
        let max_delta = self
            .offsets
            .iter()
            .map(|offset| offset - base)
            .max()
            .unwrap_or(0);
        let width = delta_width(max_delta);

        let mut buf = Vec::with_capacity(9 + self.offsets.len() * width as usize);
        buf.put_u32_le(self.offsets.len() as u32);
        buf.put_u32_le(base);
        buf.put_u8(width);
        for offset in &self.offsets {
            buf.put_uint_le((offset - base) as u64, width as usize);
        }
        buf
    }
}

fn delta_width(max_delta: u32) -> u8 {
    match max_delta {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Fixed-offset index decoder over a serialised block
#[derive(Debug, Default)]
pub struct FixedOffsetDecoder {
    base: u32,
    width: u8,
    count: usize,
    deltas: Vec<u8>,
}

impl FixedOffsetDecoder {
    /// Parse a serialised index
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(EmberError::InvalidFormat(
                "fixed offset block shorter than header".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(data);
        let count = cursor.get_u32_le() as usize;
        let base = cursor.get_u32_le();
        let width = cursor.get_u8();
        if !(1..=4).contains(&width) {
            return Err(EmberError::InvalidFormat(format!(
                "invalid fixed offset width: {}",
                width
            )));
        }
        let deltas_len = count
            .checked_mul(width as usize)
            .ok_or_else(|| EmberError::InvalidFormat("fixed offset count overflow".into()))?;
        if data.len() < 9 + deltas_len {
            return Err(EmberError::InvalidFormat(
                "fixed offset deltas truncated".into(),
            ));
        }
        Ok(Self {
            base,
            width,
            count,
            deltas: data[9..9 + deltas_len].to_vec(),
        })
    }

    /// Number of offsets in the index
    pub fn size(&self) -> usize {
        self.count
    }

    /// Offset of the entry at `idx`
    pub fn get(&self, idx: usize) -> Option<u32> {
        if idx >= self.count {
            return None;
        }
        let width = self.width as usize;
        let mut cursor = std::io::Cursor::new(&self.deltas[idx * width..(idx + 1) * width]);
        Some(self.base + cursor.get_uint_le(width) as u32)
    }

    /// Slice of `block` holding the entry at `idx`
    ///
    /// Entry bounds come from consecutive offsets; the last entry runs to the
    /// end of the block.
    pub fn get_block<'a>(&self, idx: usize, block: &'a [u8]) -> Result<&'a [u8]> {
        let start = self
            .get(idx)
            .ok_or_else(|| EmberError::InvalidFormat(format!("offset index {} out of range", idx)))?
            as usize;
        let end = match self.get(idx + 1) {
            Some(next) => next as usize,
            None => block.len(),
        };
        if start > end || end > block.len() {
            return Err(EmberError::Corruption(format!(
                "offset entry {} out of block bounds: [{}, {}) of {}",
                idx,
                start,
                end,
                block.len()
            )));
        }
        Ok(&block[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut encoder = FixedOffsetEncoder::new();
        for offset in [0u32, 10, 10, 300, 70_000, 70_001] {
            encoder.add(offset);
        }
        let data = encoder.marshal();

        let decoder = FixedOffsetDecoder::unmarshal(&data).unwrap();
        assert_eq!(decoder.size(), 6);
        assert_eq!(decoder.get(0), Some(0));
        assert_eq!(decoder.get(3), Some(300));
        assert_eq!(decoder.get(5), Some(70_001));
        assert_eq!(decoder.get(6), None);
    }

    #[test]
    fn test_nonzero_base_uses_narrow_width() {
        let mut encoder = FixedOffsetEncoder::new();
        encoder.add(1_000_000);
        encoder.add(1_000_010);
        let data = encoder.marshal();
        // two one-byte deltas after the header
        assert_eq!(data.len(), 9 + 2);

        let decoder = FixedOffsetDecoder::unmarshal(&data).unwrap();
        assert_eq!(decoder.get(0), Some(1_000_000));
        assert_eq!(decoder.get(1), Some(1_000_010));
    }

    #[test]
    fn test_get_block() {
        let mut encoder = FixedOffsetEncoder::new();
        encoder.add(0);
        encoder.add(3);
        encoder.add(3);
        let data = encoder.marshal();
        let decoder = FixedOffsetDecoder::unmarshal(&data).unwrap();

        let block = b"abcdef";
        assert_eq!(decoder.get_block(0, block).unwrap(), b"abc");
        assert_eq!(decoder.get_block(1, block).unwrap(), b"");
        assert_eq!(decoder.get_block(2, block).unwrap(), b"def");
        assert!(decoder.get_block(3, block).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let mut encoder = FixedOffsetEncoder::new();
        encoder.add(0);
        encoder.add(500);
        let data = encoder.marshal();
        assert!(FixedOffsetDecoder::unmarshal(&data[..data.len() - 1]).is_err());
        assert!(FixedOffsetDecoder::unmarshal(&data[..5]).is_err());
    }
}
