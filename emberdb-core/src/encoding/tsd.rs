//! TSD codec: per-slot time-series streams
//!
//! A TSD stream covers one field of one series within one family. Time lives
//! in the slot grid, so the stream only carries a presence bit-set over
//! `[start_slot, end_slot]` plus XOR-compressed values in slot order:
//!
//! ```text
//! [ start_slot:u16_le | end_slot:u16_le | presence bits | xor values ]
//! ```

use super::bitstream::{BitReader, BitWriter};
use crate::types::{AggType, SlotId};
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// TSD stream encoder with per-slot aggregation
#[derive(Debug, Default)]
pub struct TsdEncoder {
    values: BTreeMap<SlotId, f64>,
}

impl TsdEncoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value, combining with an existing slot value via `agg`
    pub fn emit(&mut self, slot: SlotId, value: f64, agg: AggType) {
        self.values
            .entry(slot)
            .and_modify(|old| *old = agg.aggregate(*old, value))
            .or_insert(value);
    }

    /// Overwrite the slot value unconditionally
    pub fn set(&mut self, slot: SlotId, value: f64) {
        self.values.insert(slot, value);
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no slot was written
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Occupied slot range
    pub fn slot_range(&self) -> Option<(SlotId, SlotId)> {
        let start = *self.values.keys().next()?;
        let end = *self.values.keys().next_back()?;
        Some((start, end))
    }

    /// Finish encoding; empty streams produce no bytes
    pub fn finish(self) -> Vec<u8> {
        let Some((start, end)) = self.slot_range() else {
            return Vec::new();
        };

        let slot_count = (end - start) as usize + 1;
        let mut out = Vec::with_capacity(4 + slot_count / 8 + self.values.len() * 2);
        out.put_u16_le(start);
        out.put_u16_le(end);

        let mut presence = vec![0u8; slot_count.div_ceil(8)];
        for slot in self.values.keys() {
            let pos = (slot - start) as usize;
            presence[pos / 8] |= 1 << (pos % 8);
        }
        out.extend_from_slice(&presence);

        let mut writer = BitWriter::with_capacity(self.values.len() * 2);
        let mut xor = XorAppender::default();
        for value in self.values.values() {
            xor.append(&mut writer, *value);
        }
        out.extend_from_slice(&writer.finish());
        out
    }
}

/// Gorilla-style XOR value compressor
#[derive(Debug, Default)]
struct XorAppender {
    count: usize,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl XorAppender {
    fn append(&mut self, writer: &mut BitWriter, value: f64) {
        let bits = value.to_bits();
        if self.count == 0 {
            writer.write_bits(bits, 64);
        } else {
            let xor = bits ^ self.prev_bits;
            if xor == 0 {
                writer.write_bit(false);
            } else {
                writer.write_bit(true);
                let leading = xor.leading_zeros();
                let trailing = xor.trailing_zeros();
                if leading >= self.prev_leading && trailing >= self.prev_trailing {
                    writer.write_bit(false);
                    let meaningful = 64 - self.prev_leading - self.prev_trailing;
                    writer.write_bits(xor >> self.prev_trailing, meaningful as usize);
                } else {
                    writer.write_bit(true);
                    let leading = leading.min(31);
                    let meaningful = 64 - leading - trailing;
                    writer.write_bits(leading as u64, 5);
                    // meaningful is in [1, 64]; store 64 as 0
                    writer.write_bits((meaningful & 63) as u64, 6);
                    writer.write_bits(xor >> trailing, meaningful as usize);
                    self.prev_leading = leading;
                    self.prev_trailing = trailing;
                }
            }
        }
        self.prev_bits = bits;
        self.count += 1;
    }
}

/// TSD stream decoder
pub struct TsdDecoder<'a> {
    start_slot: SlotId,
    end_slot: SlotId,
    presence: &'a [u8],
    reader: BitReader<'a>,
    cursor: usize,
    xor: XorExtractor,
}

impl<'a> TsdDecoder<'a> {
    /// Parse a TSD stream header
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(EmberError::InvalidFormat(
                "tsd stream shorter than header".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(data);
        let start_slot = cursor.get_u16_le();
        let end_slot = cursor.get_u16_le();
        if end_slot < start_slot {
            return Err(EmberError::InvalidFormat(format!(
                "tsd slot range reversed: [{}, {}]",
                start_slot, end_slot
            )));
        }
        let slot_count = (end_slot - start_slot) as usize + 1;
        let presence_len = slot_count.div_ceil(8);
        if data.len() < 4 + presence_len {
            return Err(EmberError::InvalidFormat(
                "tsd presence bits truncated".into(),
            ));
        }
        Ok(Self {
            start_slot,
            end_slot,
            presence: &data[4..4 + presence_len],
            reader: BitReader::new(&data[4 + presence_len..]),
            cursor: 0,
            xor: XorExtractor::default(),
        })
    }

    /// First occupied slot of the stream
    pub fn start_slot(&self) -> SlotId {
        self.start_slot
    }

    /// Last occupied slot of the stream
    pub fn end_slot(&self) -> SlotId {
        self.end_slot
    }

    fn has_slot(&self, pos: usize) -> bool {
        self.presence[pos / 8] & (1 << (pos % 8)) != 0
    }
}

impl Iterator for TsdDecoder<'_> {
    type Item = (SlotId, f64);

    fn next(&mut self) -> Option<(SlotId, f64)> {
        let slot_count = (self.end_slot - self.start_slot) as usize + 1;
        while self.cursor < slot_count {
            let pos = self.cursor;
            self.cursor += 1;
            if self.has_slot(pos) {
                let value = self.xor.extract(&mut self.reader)?;
                return Some((self.start_slot + pos as SlotId, value));
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct XorExtractor {
    count: usize,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl XorExtractor {
    fn extract(&mut self, reader: &mut BitReader<'_>) -> Option<f64> {
        let bits = if self.count == 0 {
            reader.read_bits(64)?
        } else if !reader.read_bit()? {
            self.prev_bits
        } else {
            if reader.read_bit()? {
                self.prev_leading = reader.read_bits(5)? as u32;
                let meaningful = match reader.read_bits(6)? as u32 {
                    0 => 64,
                    n => n,
                };
                self.prev_trailing = 64 - self.prev_leading - meaningful;
            }
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            let xor = reader.read_bits(meaningful as usize)? << self.prev_trailing;
            self.prev_bits ^ xor
        };
        self.prev_bits = bits;
        self.count += 1;
        Some(f64::from_bits(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(points: &[(SlotId, f64)]) -> Vec<(SlotId, f64)> {
        let mut encoder = TsdEncoder::new();
        for (slot, value) in points {
            encoder.emit(*slot, *value, AggType::Sum);
        }
        let data = encoder.finish();
        TsdDecoder::new(&data).unwrap().collect()
    }

    #[test]
    fn test_round_trip_sparse() {
        let points = vec![(3, 1.5), (7, -2.25), (200, 0.0), (201, 1e300)];
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_round_trip_dense_constant() {
        let points: Vec<_> = (0..360).map(|slot| (slot as SlotId, 42.0)).collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_same_slot_aggregates() {
        let mut encoder = TsdEncoder::new();
        encoder.emit(5, 1.0, AggType::Sum);
        encoder.emit(5, 2.0, AggType::Sum);
        let data = encoder.finish();
        let points: Vec<_> = TsdDecoder::new(&data).unwrap().collect();
        assert_eq!(points, vec![(5, 3.0)]);
    }

    #[test]
    fn test_last_write_wins() {
        let mut encoder = TsdEncoder::new();
        encoder.emit(9, 1.0, AggType::Last);
        encoder.emit(9, 7.0, AggType::Last);
        let data = encoder.finish();
        let points: Vec<_> = TsdDecoder::new(&data).unwrap().collect();
        assert_eq!(points, vec![(9, 7.0)]);
    }

    #[test]
    fn test_empty_stream() {
        let encoder = TsdEncoder::new();
        assert!(encoder.finish().is_empty());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut encoder = TsdEncoder::new();
        encoder.set(0, 1.0);
        encoder.set(100, 2.0);
        let data = encoder.finish();
        assert!(TsdDecoder::new(&data[..3]).is_err());
        assert!(TsdDecoder::new(&data[..10]).is_err());
    }

    #[test]
    fn test_random_sparse_round_trip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..20 {
            let mut encoder = TsdEncoder::new();
            let mut expected = std::collections::BTreeMap::new();
            for _ in 0..rng.gen_range(1..200) {
                let slot: SlotId = rng.gen_range(0..2000);
                let value: f64 = rng.gen_range(-1.0e6..1.0e6);
                encoder.set(slot, value);
                expected.insert(slot, value);
            }
            let data = encoder.finish();
            let points: Vec<_> = TsdDecoder::new(&data).unwrap().collect();
            assert_eq!(points, expected.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_varying_values() {
        let points: Vec<_> = (0..1000)
            .map(|i| (i as SlotId, 20.0 + (i as f64 * 0.1).sin() * 5.0))
            .collect();
        assert_eq!(round_trip(&points), points);
    }
}
