//! Default constants for Flowline configuration
//!
//! These constants define the default values used by the storage
//! configuration when no explicit value is provided.

/// Default commit log directory
pub const DEFAULT_COMMITLOG_DIR: &str = "./store/commitlog";

/// Default commit log segment size in bytes (1 GB)
pub const DEFAULT_COMMITLOG_FILE_SIZE: usize = 1024 * 1024 * 1024;

/// Default maximum encoded message size in bytes (4 MB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024 * 4;

/// Default async flush interval in milliseconds
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

/// Default minimum number of dirty pages before an async flush proceeds
pub const DEFAULT_FLUSH_LEAST_PAGES: usize = 4;

/// Default ceiling on time between flushes; past it a flush is forced
/// regardless of accumulated page count (10 s)
pub const DEFAULT_FLUSH_THOROUGH_INTERVAL_MS: u64 = 1000 * 10;

/// Default commit interval in milliseconds (transient pool mode)
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 200;

/// Default minimum number of pages before a commit proceeds
pub const DEFAULT_COMMIT_LEAST_PAGES: usize = 4;

/// Default ceiling on time between commits (transient pool mode)
pub const DEFAULT_COMMIT_THOROUGH_INTERVAL_MS: u64 = 200;

/// Default timeout a producer waits for a synchronous flush (5 s)
pub const DEFAULT_SYNC_FLUSH_TIMEOUT_MS: u64 = 1000 * 5;

/// Default number of transient pool buffers
pub const DEFAULT_TRANSIENT_POOL_BUFFERS: usize = 5;

/// OS page size used for dirty-page math
pub const OS_PAGE_SIZE: usize = 4096;

/// Default delay level table for scheduled delivery
pub const DEFAULT_DELAY_LEVELS: &str = "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h";

/// In-lock append time past which a warning is logged (ms)
pub const SLOW_APPEND_WARN_MS: i64 = 500;

/// Flush/commit duration past which a warning is logged (ms)
pub const SLOW_FLUSH_WARN_MS: u64 = 500;
