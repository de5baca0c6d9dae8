//! Engine configuration and per-database limits

use crate::types::IntervalOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest allowed WAL page size (128 MiB)
pub const MIN_PAGE_SIZE: usize = 128 * 1024 * 1024;

/// Largest allowed WAL page size (1 GiB)
pub const MAX_PAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root data directory
    pub data_dir: PathBuf,
    /// WAL page size in bytes, clamped to `[128 MiB, 1 GiB]`
    pub page_size: usize,
    /// Memdb size beyond which a flush is scheduled
    pub max_memdb_size: usize,
    /// Age beyond which a mutable memdb is flushed
    pub mutable_memdb_ttl: Duration,
    /// Process memory ratio above which flushing starts
    pub max_mem_usage_before_flush: f64,
    /// Process memory ratio at which pressure flushing stops
    pub target_mem_usage_after_flush: f64,
    /// Number of flush/compaction workers
    pub flush_concurrency: usize,
    /// Interval of the family TTL task
    pub ttl_task_interval: Duration,
    /// Interval of the WAL page GC task
    pub remove_task_interval: Duration,
    /// Idle TTL of cached table readers
    pub table_cache_ttl: Duration,
    /// Compaction output file rollover size
    pub max_file_size: u64,
    /// Level-0 file count that triggers compaction
    pub level0_compaction_threshold: usize,
    /// Time grid of new databases
    pub intervals: IntervalOptions,
    /// Per-database write and read limits
    pub limits: Limits,
}

impl EngineConfig {
    /// Config rooted at the given directory, defaults elsewhere
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Page size clamped to the supported range
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            page_size: MIN_PAGE_SIZE,
            max_memdb_size: 500 * 1024 * 1024,
            mutable_memdb_ttl: Duration::from_secs(30 * 60),
            max_mem_usage_before_flush: 0.75,
            target_mem_usage_after_flush: 0.60,
            flush_concurrency: num_cpus::get().div_ceil(2),
            ttl_task_interval: Duration::from_secs(24 * 3600),
            remove_task_interval: Duration::from_secs(60),
            table_cache_ttl: Duration::from_secs(10 * 60),
            max_file_size: 256 * 1024 * 1024,
            level0_compaction_threshold: 4,
            intervals: IntervalOptions::default(),
            limits: Limits::default(),
        }
    }
}

/// Per-database admission and query limits
///
/// A zero value disables the corresponding check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_namespaces: u32,
    pub max_namespace_length: usize,
    pub max_metrics: u32,
    pub max_metric_name_length: usize,
    pub max_field_name_length: usize,
    pub max_fields_per_metric: usize,
    pub max_tag_name_length: usize,
    pub max_tag_value_length: usize,
    pub max_tags_per_metric: usize,
    pub max_series_per_metric: u32,
    pub max_series_per_query: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_namespaces: 0,
            max_namespace_length: 256,
            max_metrics: 0,
            max_metric_name_length: 256,
            max_field_name_length: 128,
            max_fields_per_metric: 256,
            max_tag_name_length: 128,
            max_tag_value_length: 1024,
            max_tags_per_metric: 32,
            max_series_per_metric: 200_000,
            max_series_per_query: 200_000,
        }
    }
}

impl Limits {
    /// Validate a namespace name against the length cap
    pub fn check_namespace(&self, namespace: &str) -> crate::Result<()> {
        if self.max_namespace_length > 0 && namespace.len() > self.max_namespace_length {
            return Err(crate::EmberError::NameTooLong {
                what: "namespace",
                len: namespace.len(),
                max: self.max_namespace_length,
            });
        }
        Ok(())
    }

    /// Validate a metric name against the length cap
    pub fn check_metric_name(&self, name: &str) -> crate::Result<()> {
        if self.max_metric_name_length > 0 && name.len() > self.max_metric_name_length {
            return Err(crate::EmberError::NameTooLong {
                what: "metric name",
                len: name.len(),
                max: self.max_metric_name_length,
            });
        }
        Ok(())
    }

    /// Validate a field name against the length cap
    pub fn check_field_name(&self, name: &str) -> crate::Result<()> {
        if self.max_field_name_length > 0 && name.len() > self.max_field_name_length {
            return Err(crate::EmberError::NameTooLong {
                what: "field name",
                len: name.len(),
                max: self.max_field_name_length,
            });
        }
        Ok(())
    }

    /// Validate a tag key name against the length cap
    pub fn check_tag_name(&self, name: &str) -> crate::Result<()> {
        if self.max_tag_name_length > 0 && name.len() > self.max_tag_name_length {
            return Err(crate::EmberError::NameTooLong {
                what: "tag name",
                len: name.len(),
                max: self.max_tag_name_length,
            });
        }
        Ok(())
    }

    /// Validate a tag value against the length cap
    pub fn check_tag_value(&self, value: &str) -> crate::Result<()> {
        if self.max_tag_value_length > 0 && value.len() > self.max_tag_value_length {
            return Err(crate::EmberError::NameTooLong {
                what: "tag value",
                len: value.len(),
                max: self.max_tag_value_length,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_clamp() {
        let mut config = EngineConfig::default();
        config.page_size = 1;
        assert_eq!(config.effective_page_size(), MIN_PAGE_SIZE);
        config.page_size = usize::MAX;
        assert_eq!(config.effective_page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_limits_disabled_by_zero() {
        let limits = Limits {
            max_namespace_length: 0,
            ..Limits::default()
        };
        assert!(limits.check_namespace(&"x".repeat(10_000)).is_ok());
    }

    #[test]
    fn test_limits_name_length() {
        let limits = Limits::default();
        assert!(limits.check_field_name(&"f".repeat(128)).is_ok());
        let err = limits.check_field_name(&"f".repeat(129)).unwrap_err();
        assert!(matches!(err, crate::EmberError::NameTooLong { .. }));
    }
}
