//! Metric block builder

use super::BLOCK_FOOTER_SIZE;
use crate::encoding::{marshal_bitmap, FixedOffsetEncoder};
use crate::types::{FieldId, FieldType, SeriesId, SlotId};
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use roaring::RoaringBitmap;

/// Builds one metric block; series must arrive in ascending id order
pub struct MetricBlockBuilder {
    field_metas: Vec<(FieldId, FieldType)>,
    buf: Vec<u8>,
    series_ids: RoaringBitmap,
    high_offsets: FixedOffsetEncoder,
    bucket: BucketState,
    start_slot: SlotId,
    end_slot: SlotId,
    has_data: bool,
}

#[derive(Default)]
struct BucketState {
    high_key: Option<u16>,
    start: u32,
    entry_offsets: FixedOffsetEncoder,
}

impl MetricBlockBuilder {
    /// Builder for a metric with the given fields, sorted by field id
    pub fn new(mut field_metas: Vec<(FieldId, FieldType)>) -> Self {
        field_metas.sort_by_key(|(id, _)| *id);
        Self {
            field_metas,
            buf: Vec::new(),
            series_ids: RoaringBitmap::new(),
            high_offsets: FixedOffsetEncoder::new(),
            bucket: BucketState::default(),
            start_slot: SlotId::MAX,
            end_slot: 0,
            has_data: false,
        }
    }

    /// Fields of this block, sorted by field id
    pub fn field_metas(&self) -> &[(FieldId, FieldType)] {
        &self.field_metas
    }

    /// Extend the covered slot range
    pub fn observe_slot_range(&mut self, start: SlotId, end: SlotId) {
        self.start_slot = self.start_slot.min(start);
        self.end_slot = self.end_slot.max(end);
        self.has_data = true;
    }

    /// Append one series entry; `streams` align with `field_metas`, empty
    /// streams mark absent fields
    pub fn add_series(&mut self, series_id: SeriesId, streams: &[Vec<u8>]) -> Result<()> {
        if streams.len() != self.field_metas.len() {
            return Err(EmberError::Internal(format!(
                "series {} has {} streams for {} fields",
                series_id,
                streams.len(),
                self.field_metas.len()
            )));
        }
        if let Some(max) = self.series_ids.max() {
            if series_id <= max {
                return Err(EmberError::KeyOutOfOrder {
                    key: series_id,
                    last: max,
                });
            }
        }
        if streams.iter().all(|stream| stream.is_empty()) {
            return Ok(());
        }

        let high = (series_id >> 16) as u16;
        if self.bucket.high_key != Some(high) {
            self.finish_bucket();
            self.bucket.high_key = Some(high);
            self.bucket.start = self.buf.len() as u32;
            self.high_offsets.add(self.buf.len() as u32);
        }

        self.bucket
            .entry_offsets
            .add(self.buf.len() as u32 - self.bucket.start);
        for stream in streams {
            self.buf.put_u32_le(stream.len() as u32);
        }
        for stream in streams {
            self.buf.extend_from_slice(stream);
        }
        self.series_ids.insert(series_id);

        // track the covered slot range from the streams themselves
        for stream in streams {
            if stream.len() >= 4 {
                let mut cursor = std::io::Cursor::new(&stream[..]);
                let start = cursor.get_u16_le();
                let end = cursor.get_u16_le();
                self.observe_slot_range(start, end);
            }
        }
        Ok(())
    }

    /// Whether no series was added
    pub fn is_empty(&self) -> bool {
        self.series_ids.is_empty()
    }

    /// Finish the block
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.series_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.finish_bucket();

        let field_meta_pos = self.buf.len() as u32;
        self.buf.put_u8(self.field_metas.len() as u8);
        for (id, field_type) in &self.field_metas {
            self.buf.put_u8(*id);
            self.buf.put_u8(*field_type as u8);
        }

        let series_ids_pos = self.buf.len() as u32;
        let bitmap = marshal_bitmap(&self.series_ids)?;
        self.buf.extend_from_slice(&bitmap);

        let high_offsets_pos = self.buf.len() as u32;
        let high_block = self.high_offsets.marshal();
        self.buf.extend_from_slice(&high_block);

        let start_slot = if self.has_data { self.start_slot } else { 0 };
        self.buf.put_u16_le(start_slot);
        self.buf.put_u16_le(self.end_slot);
        self.buf.put_u32_le(field_meta_pos);
        self.buf.put_u32_le(series_ids_pos);
        self.buf.put_u32_le(high_offsets_pos);
        let crc = crc32fast::hash(&self.buf[..self.buf.len() - (BLOCK_FOOTER_SIZE - 4)]);
        self.buf.put_u32_le(crc);
        Ok(self.buf)
    }

    /// Close the open bucket: entry offsets block plus its relative position
    fn finish_bucket(&mut self) {
        if self.bucket.high_key.is_none() {
            return;
        }
        let offsets = std::mem::take(&mut self.bucket.entry_offsets);
        let block = offsets.marshal();
        let offsets_pos = self.buf.len() as u32 - self.bucket.start;
        self.buf.extend_from_slice(&block);
        self.buf.put_u32_le(offsets_pos);
        self.bucket.high_key = None;
    }
}
