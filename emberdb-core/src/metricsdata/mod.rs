//! Metric blocks: the value payload of data-family tables
//!
//! A data-family table maps `MetricId -> metric block`. One block carries
//! every series of the metric within the family:
//!
//! ```text
//! [ series_buckets | field_metas(1B count, 2B*n)
//!   | series_ids_bitmap | high_offsets_fixed | footer(20B) ]
//! footer = [ start_slot:u16 | end_slot:u16 | field_meta_pos:u32
//!            | series_ids_pos:u32 | high_offsets_pos:u32 | crc32:u32 ]
//! ```
//!
//! Series are grouped into buckets by the high 16 bits of their id; the
//! fixed-offset index over bucket starts plus the rank of the low 16 bits
//! inside the bucket's bitmap container resolve a series to its entry.

mod merger;
mod reader;
mod writer;

pub use merger::{MetricDataMerger, MetricDataMergerFactory};
pub use reader::{MetricBlockReader, SeriesEntry};
pub use writer::MetricBlockBuilder;

/// Footer size of a metric block
pub const BLOCK_FOOTER_SIZE: usize = 20;
