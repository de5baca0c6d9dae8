//! Metric block reader

use super::BLOCK_FOOTER_SIZE;
use crate::encoding::{unmarshal_bitmap, FixedOffsetDecoder};
use crate::types::{FieldId, FieldType, SeriesId, SlotId};
use crate::{EmberError, Result};
use bytes::Buf;
use roaring::RoaringBitmap;

/// Read view over one metric block
pub struct MetricBlockReader<'a> {
    data: &'a [u8],
    start_slot: SlotId,
    end_slot: SlotId,
    field_metas: Vec<(FieldId, FieldType)>,
    series_ids: RoaringBitmap,
    high_keys: Vec<u16>,
    high_offsets: FixedOffsetDecoder,
    field_meta_pos: usize,
}

impl<'a> MetricBlockReader<'a> {
    /// Parse and validate a metric block
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < BLOCK_FOOTER_SIZE {
            return Err(EmberError::Corruption(
                "metric block shorter than footer".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(&data[data.len() - BLOCK_FOOTER_SIZE..]);
        let start_slot = cursor.get_u16_le();
        let end_slot = cursor.get_u16_le();
        let field_meta_pos = cursor.get_u32_le() as usize;
        let series_ids_pos = cursor.get_u32_le() as usize;
        let high_offsets_pos = cursor.get_u32_le() as usize;
        let crc = cursor.get_u32_le();

        // the crc covers the body, excluding the footer itself
        let body_end = data.len() - BLOCK_FOOTER_SIZE;
        let actual = crc32fast::hash(&data[..body_end]);
        if actual != crc {
            return Err(EmberError::ChecksumMismatch {
                expected: crc,
                actual,
            });
        }
        let footer_start = data.len() - BLOCK_FOOTER_SIZE;
        if field_meta_pos > series_ids_pos
            || series_ids_pos > high_offsets_pos
            || high_offsets_pos > footer_start
        {
            return Err(EmberError::Corruption(format!(
                "metric block positions out of order: {} {} {} {}",
                field_meta_pos, series_ids_pos, high_offsets_pos, footer_start
            )));
        }

        let metas_block = &data[field_meta_pos..series_ids_pos];
        if metas_block.is_empty() {
            return Err(EmberError::Corruption("metric block missing fields".into()));
        }
        let count = metas_block[0] as usize;
        if metas_block.len() < 1 + count * 2 {
            return Err(EmberError::Corruption(
                "metric block field metas truncated".into(),
            ));
        }
        let mut field_metas = Vec::with_capacity(count);
        for i in 0..count {
            let id = metas_block[1 + i * 2];
            let field_type = FieldType::try_from(metas_block[2 + i * 2])?;
            field_metas.push((id, field_type));
        }

        let series_ids = unmarshal_bitmap(&data[series_ids_pos..high_offsets_pos])?;
        let high_offsets =
            FixedOffsetDecoder::unmarshal(&data[high_offsets_pos..footer_start])?;
        let high_keys = crate::encoding::high_keys(&series_ids);
        if high_keys.len() != high_offsets.size() {
            return Err(EmberError::Corruption(format!(
                "{} bucket offsets for {} high keys",
                high_offsets.size(),
                high_keys.len()
            )));
        }

        Ok(Self {
            data,
            start_slot,
            end_slot,
            field_metas,
            series_ids,
            high_keys,
            high_offsets,
            field_meta_pos,
        })
    }

    /// First slot covered by the block
    pub fn start_slot(&self) -> SlotId {
        self.start_slot
    }

    /// Last slot covered by the block
    pub fn end_slot(&self) -> SlotId {
        self.end_slot
    }

    /// Fields stored in the block, sorted by field id
    pub fn field_metas(&self) -> &[(FieldId, FieldType)] {
        &self.field_metas
    }

    /// Ids of the series stored in the block
    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    /// Locate one series entry
    pub fn get_series(&self, series_id: SeriesId) -> Result<Option<SeriesEntry<'a>>> {
        if !self.series_ids.contains(series_id) {
            return Ok(None);
        }
        let high = (series_id >> 16) as u16;
        let bucket_idx = self
            .high_keys
            .binary_search(&high)
            .map_err(|_| EmberError::Corruption(format!("bucket for series {} lost", series_id)))?;

        let bucket_start = self.high_offsets.get(bucket_idx).ok_or_else(|| {
            EmberError::Corruption(format!("bucket offset {} missing", bucket_idx))
        })? as usize;
        let bucket_end = match self.high_offsets.get(bucket_idx + 1) {
            Some(next) => next as usize,
            None => self.field_meta_pos,
        };
        if bucket_start + 4 > bucket_end || bucket_end > self.data.len() {
            return Err(EmberError::Corruption(format!(
                "bucket {} bounds invalid: [{}, {})",
                bucket_idx, bucket_start, bucket_end
            )));
        }
        let bucket = &self.data[bucket_start..bucket_end];
        let offsets_pos =
            std::io::Cursor::new(&bucket[bucket.len() - 4..]).get_u32_le() as usize;
        if offsets_pos + 4 > bucket.len() {
            return Err(EmberError::Corruption(format!(
                "bucket {} offsets position invalid: {}",
                bucket_idx, offsets_pos
            )));
        }
        let entry_offsets = FixedOffsetDecoder::unmarshal(&bucket[offsets_pos..bucket.len() - 4])?;

        // entry index = rank of the low id within this bucket's container
        let container_start = (high as u32) << 16;
        let rank_below = if container_start == 0 {
            0
        } else {
            self.series_ids.rank(container_start - 1)
        };
        let entry_idx = (self.series_ids.rank(series_id) - rank_below - 1) as usize;
        let entry = entry_offsets.get_block(entry_idx, &bucket[..offsets_pos])?;
        SeriesEntry::new(entry, &self.field_metas).map(Some)
    }
}

/// One series' per-field streams inside a metric block
pub struct SeriesEntry<'a> {
    data: &'a [u8],
    lengths: Vec<u32>,
    field_ids: Vec<FieldId>,
}

impl<'a> SeriesEntry<'a> {
    fn new(data: &'a [u8], field_metas: &[(FieldId, FieldType)]) -> Result<Self> {
        let n = field_metas.len();
        if data.len() < n * 4 {
            return Err(EmberError::Corruption(
                "series entry header truncated".into(),
            ));
        }
        let mut cursor = std::io::Cursor::new(data);
        let mut lengths = Vec::with_capacity(n);
        for _ in 0..n {
            lengths.push(cursor.get_u32_le());
        }
        let total: u64 = lengths.iter().map(|len| *len as u64).sum();
        if n as u64 * 4 + total != data.len() as u64 {
            return Err(EmberError::Corruption(format!(
                "series entry of {} bytes carries {} stream bytes",
                data.len(),
                total
            )));
        }
        Ok(Self {
            data,
            lengths,
            field_ids: field_metas.iter().map(|(id, _)| *id).collect(),
        })
    }

    /// TSD stream of one field, `None` if the series lacks it
    pub fn field_stream(&self, field_id: FieldId) -> Option<&'a [u8]> {
        let idx = self.field_ids.iter().position(|id| *id == field_id)?;
        if self.lengths[idx] == 0 {
            return None;
        }
        let header = self.field_ids.len() * 4;
        let start = header + self.lengths[..idx].iter().sum::<u32>() as usize;
        Some(&self.data[start..start + self.lengths[idx] as usize])
    }
}
