//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a closed page factory
    #[error("page factory is closed")]
    FactoryClosed,

    /// Operation on a closed queue
    #[error("queue is closed")]
    QueueClosed,

    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),

    /// SST file failed validation on open
    #[error("corrupt sst file: {0}")]
    CorruptSst(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Point lookup missed; callers treat this as absence, not failure
    #[error("key not exist in kv table")]
    KeyNotExist,

    /// Keys must be added to a table builder in ascending order
    #[error("key {key} out of order, last added {last}")]
    KeyOutOfOrder { key: u32, last: u32 },

    /// WAL payload could not be decompressed
    #[error("decompress failure: {0}")]
    Decompress(String),

    /// Invalid data format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Namespace count limit reached
    #[error("too many namespaces, max {max}")]
    TooManyNamespaces { max: u32 },

    /// Metric count limit reached
    #[error("too many metrics, max {max}")]
    TooManyMetrics { max: u32 },

    /// Tag key count limit reached for one metric
    #[error("too many tag keys, max {max}")]
    TooManyTagKeys { max: usize },

    /// Field count limit reached for one metric
    #[error("too many fields, max {max}")]
    TooManyFields { max: usize },

    /// Series cardinality limit reached for one metric
    #[error("too many series, max {max}")]
    TooManySeries { max: u32 },

    /// A name exceeded its configured length cap
    #[error("{what} too long: {len} > {max}")]
    NameTooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// Metric name could not be resolved at query time
    #[error("metric not found: {0}")]
    MetricNotFound(String),

    /// Field name could not be resolved at query time
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// Tag key could not be resolved at query time
    #[error("tag key not found: {0}")]
    TagKeyNotFound(String),

    /// Query planning error (unsupported operator, bad argument)
    #[error("plan error: {0}")]
    Plan(String),

    /// Query was canceled
    #[error("query canceled")]
    Canceled,

    /// Compaction job failed; inputs are kept and the job retried later
    #[error("compaction error: {0}")]
    Compaction(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl EmberError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Io(_) | EmberError::Compaction(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EmberError::Corruption(_)
                | EmberError::CorruptSst(_)
                | EmberError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is a write admission rejection
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            EmberError::TooManyNamespaces { .. }
                | EmberError::TooManyMetrics { .. }
                | EmberError::TooManyTagKeys { .. }
                | EmberError::TooManyFields { .. }
                | EmberError::TooManySeries { .. }
                | EmberError::NameTooLong { .. }
        )
    }
}
