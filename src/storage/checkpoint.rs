//! Store checkpoint
//!
//! The checkpoint records the slowest-advancing durable timestamp across
//! the commit log and the secondary index pipelines. Abnormal recovery uses
//! its minimum to pick the first segment that is certainly fully indexed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Safety margin subtracted from the minimum timestamp (ms)
const MIN_TIMESTAMP_MARGIN_MS: i64 = 1000 * 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointSnapshot {
    physic_msg_timestamp: i64,
    logics_msg_timestamp: i64,
    index_msg_timestamp: i64,
}

/// Durable timestamp gauges, persisted as JSON next to the log
pub struct StoreCheckpoint {
    path: PathBuf,
    physic_msg_timestamp: AtomicI64,
    logics_msg_timestamp: AtomicI64,
    index_msg_timestamp: AtomicI64,
}

impl StoreCheckpoint {
    /// Open the checkpoint file, starting from zeros when absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<CheckpointSnapshot>(&raw).unwrap_or_else(|e| {
                warn!(file = %path.display(), error = %e, "checkpoint unreadable, starting fresh");
                CheckpointSnapshot::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            physic_msg_timestamp: AtomicI64::new(snapshot.physic_msg_timestamp),
            logics_msg_timestamp: AtomicI64::new(snapshot.logics_msg_timestamp),
            index_msg_timestamp: AtomicI64::new(snapshot.index_msg_timestamp),
        })
    }

    pub fn physic_msg_timestamp(&self) -> i64 {
        self.physic_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physic_msg_timestamp(&self, ts: i64) {
        self.physic_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn logics_msg_timestamp(&self) -> i64 {
        self.logics_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_logics_msg_timestamp(&self, ts: i64) {
        self.logics_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn index_msg_timestamp(&self) -> i64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_index_msg_timestamp(&self, ts: i64) {
        self.index_msg_timestamp.store(ts, Ordering::Release);
    }

    /// Slowest of the commit log and consumer-queue timestamps, with a
    /// safety margin
    pub fn min_timestamp(&self) -> i64 {
        let min = self
            .physic_msg_timestamp()
            .min(self.logics_msg_timestamp());
        (min - MIN_TIMESTAMP_MARGIN_MS).max(0)
    }

    /// As [`min_timestamp`](Self::min_timestamp), additionally bounded by
    /// the message-index timestamp
    pub fn min_timestamp_index(&self) -> i64 {
        self.min_timestamp().min(self.index_msg_timestamp())
    }

    /// Persist the gauges; written to a sibling file first, then renamed
    ///
    /// The temp file is synced before the rename and the parent directory
    /// after it, so neither the contents nor the rename can be lost on
    /// power failure. Abnormal recovery truncates the log from these
    /// timestamps, so a stale-but-complete checkpoint is the only
    /// acceptable crash outcome.
    pub fn flush(&self) -> Result<()> {
        let snapshot = CheckpointSnapshot {
            physic_msg_timestamp: self.physic_msg_timestamp(),
            logics_msg_timestamp: self.logics_msg_timestamp(),
            index_msg_timestamp: self.index_msg_timestamp(),
        };
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(&snapshot)?)?;
            // contents must be durable before the rename can point at them
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        // sync the directory so the rename itself survives power failure
        if let Some(parent) = parent {
            std::fs::File::open(parent)?.sync_all()?;
        }

        debug!(file = %self.path.display(), "checkpoint flushed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint");

        let checkpoint = StoreCheckpoint::open(&path).unwrap();
        checkpoint.set_physic_msg_timestamp(10_000);
        checkpoint.set_logics_msg_timestamp(8_000);
        checkpoint.set_index_msg_timestamp(6_000);
        checkpoint.flush().unwrap();

        let reloaded = StoreCheckpoint::open(&path).unwrap();
        assert_eq!(reloaded.physic_msg_timestamp(), 10_000);
        assert_eq!(reloaded.logics_msg_timestamp(), 8_000);
        assert_eq!(reloaded.index_msg_timestamp(), 6_000);
    }

    #[test]
    fn test_min_timestamps() {
        let dir = tempdir().unwrap();
        let checkpoint = StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap();
        checkpoint.set_physic_msg_timestamp(100_000);
        checkpoint.set_logics_msg_timestamp(50_000);
        checkpoint.set_index_msg_timestamp(20_000);

        assert_eq!(checkpoint.min_timestamp(), 50_000 - 3000);
        assert_eq!(checkpoint.min_timestamp_index(), 20_000);
    }

    #[test]
    fn test_min_timestamp_never_negative() {
        let dir = tempdir().unwrap();
        let checkpoint = StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap();
        assert_eq!(checkpoint.min_timestamp(), 0);
    }

    #[test]
    fn test_garbage_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint");
        std::fs::write(&path, b"not json at all").unwrap();
        let checkpoint = StoreCheckpoint::open(&path).unwrap();
        assert_eq!(checkpoint.physic_msg_timestamp(), 0);
    }
}
