//! Core identifiers and the time grid

use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Dense metric identifier, allocated per `(namespace, metric_name)`
pub type MetricId = u32;

/// Field identifier, dense in `[0, n)` within one metric
pub type FieldId = u8;

/// Tag key identifier within one metric
pub type TagKeyId = u32;

/// Tag value identifier within one tag key
pub type TagValueId = u32;

/// Series identifier within one metric on one shard; one unique tag-value combination
pub type SeriesId = u32;

/// Shard identifier
pub type ShardId = u32;

/// Monotone file number within one KV store
pub type FileNumber = u64;

/// Time-bucket index within a family
pub type SlotId = u16;

/// Sequence returned by `consume` when no new message is available
pub const SEQ_NO_NEW_MESSAGE: i64 = i64::MIN;

/// Leader id meaning "no leader elected"
pub const NO_LEADER: i32 = -1;

/// Aggregation type of a field or a query function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AggType {
    Sum = 1,
    Min = 2,
    Max = 3,
    First = 4,
    Last = 5,
    Count = 6,
}

impl AggType {
    /// Combine two values that landed on the same slot
    pub fn aggregate(&self, old: f64, new: f64) -> f64 {
        match self {
            AggType::Sum | AggType::Count => old + new,
            AggType::Min => old.min(new),
            AggType::Max => old.max(new),
            AggType::First => old,
            AggType::Last => new,
        }
    }
}

impl TryFrom<u8> for AggType {
    type Error = crate::EmberError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(AggType::Sum),
            2 => Ok(AggType::Min),
            3 => Ok(AggType::Max),
            4 => Ok(AggType::First),
            5 => Ok(AggType::Last),
            6 => Ok(AggType::Count),
            _ => Err(crate::EmberError::InvalidFormat(format!(
                "invalid agg type: {}",
                value
            ))),
        }
    }
}

/// Field type declared in a metric schema; determines the storage aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Sum = 1,
    Min = 2,
    Max = 3,
    Gauge = 4,
    Histogram = 5,
}

impl FieldType {
    /// Aggregation applied when two writes land on the same slot
    pub fn agg_type(&self) -> AggType {
        match self {
            FieldType::Sum | FieldType::Histogram => AggType::Sum,
            FieldType::Min => AggType::Min,
            FieldType::Max => AggType::Max,
            FieldType::Gauge => AggType::Last,
        }
    }

    /// Whether a query function is applicable to this field type
    pub fn supports(&self, agg: AggType) -> bool {
        match self {
            FieldType::Histogram => matches!(agg, AggType::Sum | AggType::Count),
            _ => !matches!(agg, AggType::Count) || *self == FieldType::Sum,
        }
    }
}

impl TryFrom<u8> for FieldType {
    type Error = crate::EmberError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(FieldType::Sum),
            2 => Ok(FieldType::Min),
            3 => Ok(FieldType::Max),
            4 => Ok(FieldType::Gauge),
            5 => Ok(FieldType::Histogram),
            _ => Err(crate::EmberError::InvalidFormat(format!(
                "invalid field type: {}",
                value
            ))),
        }
    }
}

/// Field metadata carried in metric blocks and schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: FieldId,
    pub field_type: FieldType,
    pub name: String,
}

/// Time range for queries, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

/// Storage interval with its family granularity and retention
///
/// A timestamp maps to a family by `family_time = truncate(ts, family)` and to
/// a slot inside the family by `slot = (ts - family_time) / storage`. The
/// family width over the storage interval must fit `u16` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Width of one slot in milliseconds
    pub storage: i64,
    /// Width of one family in milliseconds
    pub family: i64,
    /// How long families are kept before the TTL task drops them
    pub retention: i64,
}

impl Interval {
    /// Create an interval, validating the slot capacity bound
    pub fn new(storage: i64, family: i64, retention: i64) -> crate::Result<Self> {
        if storage <= 0 || family <= 0 || family % storage != 0 {
            return Err(crate::EmberError::InvalidFormat(format!(
                "family width {} not a multiple of storage interval {}",
                family, storage
            )));
        }
        if family / storage > u16::MAX as i64 + 1 {
            return Err(crate::EmberError::InvalidFormat(format!(
                "family width {} over storage interval {} exceeds slot capacity",
                family, storage
            )));
        }
        Ok(Self {
            storage,
            family,
            retention,
        })
    }

    /// Family time owning the timestamp
    pub fn family_time(&self, ts: Timestamp) -> Timestamp {
        ts - ts.rem_euclid(self.family)
    }

    /// Slot of the timestamp inside its family
    pub fn slot(&self, ts: Timestamp) -> SlotId {
        ((ts - self.family_time(ts)) / self.storage) as SlotId
    }

    /// Number of slots per family
    pub fn slots_per_family(&self) -> usize {
        (self.family / self.storage) as usize
    }

    /// Timestamp of a slot inside the given family
    pub fn slot_time(&self, family_time: Timestamp, slot: SlotId) -> Timestamp {
        family_time + slot as i64 * self.storage
    }
}

/// Ordered interval set of a database, finest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalOptions {
    pub intervals: Vec<Interval>,
}

impl IntervalOptions {
    /// Finest (write) interval
    pub fn write_interval(&self) -> Interval {
        self.intervals[0]
    }

    /// Rollup targets, coarser than the write interval
    pub fn rollup_targets(&self) -> &[Interval] {
        &self.intervals[1..]
    }
}

impl Default for IntervalOptions {
    fn default() -> Self {
        // 10s slots in 1h families kept 1 month, 10m slots in 1d families kept 1 year
        Self {
            intervals: vec![
                Interval {
                    storage: 10_000,
                    family: 3_600_000,
                    retention: 30 * 24 * 3_600_000,
                },
                Interval {
                    storage: 600_000,
                    family: 86_400_000,
                    retention: 365 * 24 * 3_600_000,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_grid() {
        let interval = Interval::new(10_000, 3_600_000, 0).unwrap();
        assert_eq!(interval.slots_per_family(), 360);

        let ts = 1_690_000_123_456;
        let family_time = interval.family_time(ts);
        assert_eq!(family_time % 3_600_000, 0);
        assert!(ts - family_time < 3_600_000);

        let slot = interval.slot(ts);
        let slot_time = interval.slot_time(family_time, slot);
        assert!(slot_time <= ts && ts < slot_time + 10_000);
    }

    #[test]
    fn test_interval_slot_capacity() {
        assert!(Interval::new(1, 86_400_000, 0).is_err());
        assert!(Interval::new(1_000, 1_500, 0).is_err());
        assert!(Interval::new(1_000, 65_536_000, 0).is_ok());
    }

    #[test]
    fn test_agg_type_combinators() {
        assert_eq!(AggType::Sum.aggregate(1.0, 2.0), 3.0);
        assert_eq!(AggType::Min.aggregate(1.0, 2.0), 1.0);
        assert_eq!(AggType::Max.aggregate(1.0, 2.0), 2.0);
        assert_eq!(AggType::First.aggregate(1.0, 2.0), 1.0);
        assert_eq!(AggType::Last.aggregate(1.0, 2.0), 2.0);
    }

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(150));
        assert!(!range1.contains(250));
    }
}
