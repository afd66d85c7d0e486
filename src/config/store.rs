//! Storage configuration for the Flowline commit log
//!
//! The flush mode is the main durability knob:
//!
//! | Mode | Durability | Performance |
//! |------|------------|-------------|
//! | `sync_flush` | Record is on disk before the producer is acknowledged | Slowest, bounded by group commit |
//! | `async_flush` | Up to `flush_interval_ms` of data at risk on power failure | Balanced (default) |
//!
//! With `transient_pool_enabled`, appends land in pooled heap buffers and a
//! dedicated commit service moves them into the mapped region before the
//! flush service syncs them; this trades one extra copy for lower page-fault
//! jitter on the append path.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::defaults::{
    DEFAULT_COMMITLOG_DIR, DEFAULT_COMMITLOG_FILE_SIZE, DEFAULT_COMMIT_INTERVAL_MS,
    DEFAULT_COMMIT_LEAST_PAGES, DEFAULT_COMMIT_THOROUGH_INTERVAL_MS, DEFAULT_DELAY_LEVELS,
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_LEAST_PAGES, DEFAULT_FLUSH_THOROUGH_INTERVAL_MS,
    DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_SYNC_FLUSH_TIMEOUT_MS, DEFAULT_TRANSIENT_POOL_BUFFERS,
};

/// When appended records are synced to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushDiskType {
    /// Producers wait on the group-commit service before acknowledgement
    SyncFlush,
    /// A background service flushes on an interval
    #[default]
    AsyncFlush,
}

/// Role of this broker in a replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerRole {
    /// Master that waits for a follower acknowledgement per message
    SyncMaster,
    /// Master that replicates in the background
    #[default]
    AsyncMaster,
    /// Follower; replication ingress only
    Slave,
}

/// Commit log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStoreConfig {
    /// Directory holding the commit log segment files
    pub commitlog_dir: PathBuf,

    /// Fixed size of each segment file in bytes
    pub commitlog_file_size: usize,

    /// Durability policy for appends
    pub flush_disk_type: FlushDiskType,

    /// Replication role
    pub broker_role: BrokerRole,

    /// Async flush service interval in milliseconds
    pub flush_interval_ms: u64,

    /// Use a plain sleep instead of a signalable wait in the flush loop
    pub flush_timed: bool,

    /// Minimum dirty pages before an async flush proceeds (0 = always)
    pub flush_least_pages: usize,

    /// Force a flush when this much time has passed since the last one
    pub flush_thorough_interval_ms: u64,

    /// Commit service interval in milliseconds (transient pool mode)
    pub commit_interval_ms: u64,

    /// Minimum dirty pages before a commit proceeds (0 = always)
    pub commit_least_pages: usize,

    /// Force a commit when this much time has passed since the last one
    pub commit_thorough_interval_ms: u64,

    /// How long a producer waits for a synchronous flush or a follower
    /// acknowledgement before its result is tagged as timed out
    pub sync_flush_timeout_ms: u64,

    /// Maximum encoded record size accepted by the append path
    pub max_message_bytes: usize,

    /// Use the parking mutex for the append lock instead of the spin lock
    pub use_mutex_append_lock: bool,

    /// Stage appends in pooled heap buffers drained by the commit service
    pub transient_pool_enabled: bool,

    /// Number of buffers in the transient pool
    pub transient_pool_buffers: usize,

    /// Verify body CRC while scanning records during recovery
    pub check_crc_on_recover: bool,

    /// Message index is maintained by the enclosing store
    pub message_index_enable: bool,

    /// Message index updates are considered crash-safe; abnormal recovery
    /// then trusts the index timestamp in the checkpoint minimum
    pub message_index_safe: bool,

    /// Re-dispatch only records below the confirm offset during abnormal
    /// recovery (master/slave duplication mode)
    pub duplication_enable: bool,

    /// Delay level table for scheduled delivery, e.g. "1s 5s 10s 30s 1m"
    pub delay_levels: String,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            commitlog_dir: PathBuf::from(DEFAULT_COMMITLOG_DIR),
            commitlog_file_size: DEFAULT_COMMITLOG_FILE_SIZE,
            flush_disk_type: FlushDiskType::default(),
            broker_role: BrokerRole::default(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_timed: false,
            flush_least_pages: DEFAULT_FLUSH_LEAST_PAGES,
            flush_thorough_interval_ms: DEFAULT_FLUSH_THOROUGH_INTERVAL_MS,
            commit_interval_ms: DEFAULT_COMMIT_INTERVAL_MS,
            commit_least_pages: DEFAULT_COMMIT_LEAST_PAGES,
            commit_thorough_interval_ms: DEFAULT_COMMIT_THOROUGH_INTERVAL_MS,
            sync_flush_timeout_ms: DEFAULT_SYNC_FLUSH_TIMEOUT_MS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            use_mutex_append_lock: false,
            transient_pool_enabled: false,
            transient_pool_buffers: DEFAULT_TRANSIENT_POOL_BUFFERS,
            check_crc_on_recover: true,
            message_index_enable: true,
            message_index_safe: false,
            duplication_enable: false,
            delay_levels: DEFAULT_DELAY_LEVELS.to_string(),
        }
    }
}

impl MessageStoreConfig {
    /// Configuration rooted at `dir` with defaults for everything else
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            commitlog_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn is_sync_flush(&self) -> bool {
        self.flush_disk_type == FlushDiskType::SyncFlush
    }
}
