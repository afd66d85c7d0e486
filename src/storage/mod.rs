//! Commit log storage engine for Flowline
//!
//! The storage engine persists every record of every topic into one
//! append-only byte stream backed by fixed-size memory-mapped segments.
//! [`CommitLog`] is the append engine and operational surface; the mapped
//! segment machinery, the durability services and the recovery scans live
//! in the submodules.

pub mod batch;
pub mod checkpoint;
pub mod commit_log;
pub mod dispatch;
pub mod flush;
pub mod ha;
pub mod lock;
pub mod mapped_file;
pub mod mapped_queue;
pub mod message;
pub mod record;
pub mod result;
pub mod schedule;

pub use batch::{BatchEncoder, BatchMessage, MessageBatch};
pub use checkpoint::StoreCheckpoint;
pub use commit_log::CommitLog;
pub use dispatch::{DispatchSink, NoopDispatchSink};
pub use flush::{FlushLatch, GroupCommitRequest};
pub use ha::{HaService, NoHaService};
pub use mapped_file::{MappedBuffer, MappedFile, TransientStorePool};
pub use mapped_queue::MappedFileQueue;
pub use message::Message;
pub use record::{DispatchRequest, BLANK_MAGIC_CODE, MESSAGE_MAGIC_CODE};
pub use result::{AppendMessageResult, AppendMessageStatus, PutMessageResult, PutMessageStatus};
pub use schedule::{DelayLevelTable, SCHEDULE_TOPIC};

/// Current wall clock in milliseconds since the epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
