//! Row batches carried by the WAL
//!
//! A WAL payload is a Snappy-compressed block of size-prefixed rows. The
//! batch buffer is reusable across consume iterations.

use crate::types::{FieldType, Timestamp};
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// One field of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowField {
    pub name: String,
    pub field_type: FieldType,
    pub value: f64,
}

/// One metric row as produced by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub namespace: String,
    pub metric: String,
    pub timestamp: Timestamp,
    /// Tag pairs, sorted by key
    pub tags: Vec<(String, String)>,
    pub fields: Vec<RowField>,
}

/// Reusable decode buffer for WAL row payloads
pub struct BatchRows {
    rows: Vec<MetricRow>,
    decoder: snap::raw::Decoder,
}

impl Default for BatchRows {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRows {
    /// Empty batch
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            decoder: snap::raw::Decoder::new(),
        }
    }

    /// Decompress and parse a WAL payload, replacing the buffered rows
    pub fn unmarshal(&mut self, payload: &[u8]) -> Result<()> {
        let block = self
            .decoder
            .decompress_vec(payload)
            .map_err(|e| EmberError::Decompress(e.to_string()))?;

        self.rows.clear();
        let mut cursor = std::io::Cursor::new(&block[..]);
        while cursor.remaining() >= 4 {
            let len = cursor.get_u32_le() as usize;
            let at = cursor.position() as usize;
            let data = block.get(at..at + len).ok_or_else(|| {
                EmberError::InvalidFormat("row batch truncated".into())
            })?;
            let row: MetricRow = bincode::deserialize(data)
                .map_err(|e| EmberError::InvalidFormat(format!("bad row: {}", e)))?;
            self.rows.push(row);
            cursor.set_position((at + len) as u64);
        }
        Ok(())
    }

    /// Sort buffered rows by timestamp, preserving arrival order for ties
    pub fn sort_by_timestamp(&mut self) {
        self.rows.sort_by_key(|row| row.timestamp);
    }

    /// Buffered rows
    pub fn rows(&self) -> &[MetricRow] {
        &self.rows
    }

    /// Number of buffered rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if no row is buffered
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Encode rows into a WAL payload (the broker-side format)
pub fn marshal_rows(rows: &[MetricRow]) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    for row in rows {
        let data = bincode::serialize(row)
            .map_err(|e| EmberError::InvalidFormat(e.to_string()))?;
        block.put_u32_le(data.len() as u32);
        block.extend_from_slice(&data);
    }
    snap::raw::Encoder::new()
        .compress_vec(&block)
        .map_err(|e| EmberError::Internal(format!("compress rows: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(metric: &str, timestamp: Timestamp) -> MetricRow {
        MetricRow {
            namespace: "default".into(),
            metric: metric.into(),
            timestamp,
            tags: vec![("host".into(), "h1".into())],
            fields: vec![RowField {
                name: "value".into(),
                field_type: FieldType::Sum,
                value: 1.5,
            }],
        }
    }

    #[test]
    fn test_round_trip() {
        let rows = vec![row("cpu", 300), row("mem", 100), row("disk", 200)];
        let payload = marshal_rows(&rows).unwrap();

        let mut batch = BatchRows::new();
        batch.unmarshal(&payload).unwrap();
        assert_eq!(batch.rows(), rows.as_slice());

        batch.sort_by_timestamp();
        let order: Vec<&str> = batch.rows().iter().map(|r| r.metric.as_str()).collect();
        assert_eq!(order, vec!["mem", "disk", "cpu"]);
    }

    #[test]
    fn test_corrupt_payload_is_decompress_error() {
        let mut batch = BatchRows::new();
        let err = batch.unmarshal(b"not snappy data").unwrap_err();
        assert!(matches!(err, EmberError::Decompress(_)));
    }

    #[test]
    fn test_batch_reuse_replaces_rows() {
        let mut batch = BatchRows::new();
        batch
            .unmarshal(&marshal_rows(&[row("a", 1), row("b", 2)]).unwrap())
            .unwrap();
        assert_eq!(batch.len(), 2);
        batch.unmarshal(&marshal_rows(&[row("c", 3)]).unwrap()).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows()[0].metric, "c");
    }
}
