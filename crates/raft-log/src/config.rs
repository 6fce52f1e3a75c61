//! Runtime configuration for the persistent log.
//!
//! A `bon::Builder` paired with `serde::{Serialize, Deserialize}` so a
//! `LogConfig` can be constructed fluently in code or round-tripped through
//! a TOML/JSON config file.

use serde::{Deserialize, Serialize};

use crate::error::{LogError, Result};

/// Configuration for a [`crate::log::PersistentLog`].
///
/// # Example
/// ```
/// use raft_log::LogConfig;
///
/// let config = LogConfig::builder()
///     .records_per_partition(64)
///     .buffer_size(4096)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct LogConfig {
    /// Entries held per partition file. Must be at least 2 (slot 0 of
    /// partition 0 is reserved for the ephemeral sentinel, so a partition
    /// needs room for at least one real entry alongside it).
    pub records_per_partition: u32,

    /// I/O buffer size used for session scratch buffers and cache
    /// population reads. Must be at least 128 bytes.
    #[builder(default = 2048)]
    pub buffer_size: u32,

    /// Bytes to pre-extend a freshly created partition's payload region by,
    /// to reduce fragmentation from repeated small file growths.
    #[builder(default = 0)]
    pub initial_partition_size: u64,

    /// Whether partitions keep an in-memory mirror of their allocation
    /// table.
    #[builder(default = true)]
    pub use_caching: bool,

    /// Maximum number of concurrent reader sessions. Must be at least 1.
    #[builder(default = 3)]
    pub max_concurrent_reads: u32,
}

impl LogConfig {
    /// Validates the documented minimums, returning [`LogError::InvalidState`]
    /// if any are violated.
    pub fn validate(&self) -> Result<()> {
        if self.records_per_partition < 2 {
            return Err(LogError::InvalidState(
                "records_per_partition must be >= 2".into(),
            ));
        }
        if self.buffer_size < 128 {
            return Err(LogError::InvalidState("buffer_size must be >= 128".into()));
        }
        if self.max_concurrent_reads < 1 {
            return Err(LogError::InvalidState(
                "max_concurrent_reads must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let config = LogConfig::builder().records_per_partition(8).build();
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.initial_partition_size, 0);
        assert!(config.use_caching);
        assert_eq!(config.max_concurrent_reads, 3);
    }

    #[test]
    fn rejects_records_per_partition_below_two() {
        let config = LogConfig::builder().records_per_partition(1).build();
        assert!(matches!(config.validate(), Err(LogError::InvalidState(_))));
    }

    #[test]
    fn rejects_undersized_buffer() {
        let config = LogConfig::builder()
            .records_per_partition(4)
            .buffer_size(64)
            .build();
        assert!(matches!(config.validate(), Err(LogError::InvalidState(_))));
    }

    #[test]
    fn round_trips_through_json() {
        let config = LogConfig::builder()
            .records_per_partition(16)
            .buffer_size(4096)
            .max_concurrent_reads(5)
            .build();
        let json = serde_json::to_string(&config).unwrap();
        let restored: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.records_per_partition, config.records_per_partition);
        assert_eq!(restored.buffer_size, config.buffer_size);
        assert_eq!(restored.max_concurrent_reads, config.max_concurrent_reads);
    }
}
