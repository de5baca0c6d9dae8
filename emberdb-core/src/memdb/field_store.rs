//! Per-series, per-field point storage

use super::buffer::{Chunk, DataPointBuffer, CHUNK_SIZE};
use crate::encoding::TsdEncoder;
use crate::types::{AggType, SlotId};
use crate::Result;
use bytes::{Buf, BufMut};

/// Bytes per point record: slot + value
const POINT_SIZE: usize = 10;
const POINTS_PER_CHUNK: usize = CHUNK_SIZE / POINT_SIZE;

/// Appends `(slot, value)` records into buffer chunks
///
/// Points are written in arrival order; duplicate slots are combined with the
/// field's storage aggregation when the store is drained into a TSD stream.
pub struct FieldStore {
    chunks: Vec<Chunk>,
    count: usize,
    start_slot: SlotId,
    end_slot: SlotId,
}

impl FieldStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            count: 0,
            start_slot: SlotId::MAX,
            end_slot: 0,
        }
    }

    /// Append one point
    pub fn write(&mut self, buffer: &DataPointBuffer, slot: SlotId, value: f64) -> Result<()> {
        let idx = self.count % POINTS_PER_CHUNK;
        if idx == 0 {
            self.chunks.push(buffer.alloc()?);
        }
        let chunk = self
            .chunks
            .last()
            .ok_or_else(|| crate::EmberError::Internal("field store chunk missing".into()))?;

        let mut record = Vec::with_capacity(POINT_SIZE);
        record.put_u16_le(slot);
        record.put_u64_le(value.to_bits());
        chunk.write(idx * POINT_SIZE, &record)?;

        self.count += 1;
        self.start_slot = self.start_slot.min(slot);
        self.end_slot = self.end_slot.max(slot);
        Ok(())
    }

    /// Number of appended points
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if no point was appended
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Approximate memory held, in bytes
    pub fn memory_size(&self) -> usize {
        self.chunks.len() * CHUNK_SIZE
    }

    /// Replay every point in write order
    pub fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(SlotId, f64),
    {
        for i in 0..self.count {
            let chunk = &self.chunks[i / POINTS_PER_CHUNK];
            let record = chunk.read((i % POINTS_PER_CHUNK) * POINT_SIZE, POINT_SIZE)?;
            let mut cursor = std::io::Cursor::new(record);
            let slot = cursor.get_u16_le();
            let value = f64::from_bits(cursor.get_u64_le());
            visit(slot, value);
        }
        Ok(())
    }

    /// Encode the points into a TSD stream, combining duplicate slots
    pub fn encode(&self, agg: AggType) -> Result<Vec<u8>> {
        let mut encoder = TsdEncoder::new();
        self.scan(|slot, value| encoder.emit(slot, value, agg))?;
        Ok(encoder.finish())
    }
}

impl Default for FieldStore {
    fn default() -> Self {
        Self::new()
    }
}
