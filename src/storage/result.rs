//! Append and put result types
//!
//! Per-record outcomes are plain status values carried in results, never
//! errors; nothing on the append path unwinds across the lock boundary.

/// Outcome of one `do_append` attempt against a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMessageStatus {
    PutOk,
    /// Segment could not fit the record; a blank trailer consumed the slack
    EndOfFile,
    MessageSizeExceeded,
    PropertiesSizeExceeded,
    UnknownError,
}

/// Result of one `do_append` attempt
#[derive(Debug, Clone)]
pub struct AppendMessageResult {
    pub status: AppendMessageStatus,
    /// Physical offset the write started at
    pub wrote_offset: i64,
    /// Bytes consumed in the segment (record length, or the blank size on
    /// `EndOfFile`)
    pub wrote_bytes: i32,
    /// Message id, comma-joined for batches
    pub msg_id: String,
    /// Store timestamp assigned under the append lock
    pub store_timestamp: i64,
    /// Queue offset assigned to the record (first record for batches)
    pub logics_offset: i64,
    /// Number of records appended (1, or the batch size)
    pub msg_num: i32,
}

impl AppendMessageResult {
    /// A failed attempt with no write
    pub fn status_only(status: AppendMessageStatus) -> Self {
        Self {
            status,
            wrote_offset: 0,
            wrote_bytes: 0,
            msg_id: String::new(),
            store_timestamp: 0,
            logics_offset: 0,
            msg_num: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AppendMessageStatus::PutOk
    }
}

/// Final status of a put operation, durability and replication included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMessageStatus {
    PutOk,
    /// Local durability missed its window; the record may still persist
    FlushDiskTimeout,
    /// Replication missed its window; the record may still replicate
    FlushSlaveTimeout,
    SlaveNotAvailable,
    /// Could not allocate a new segment
    CreateMappedFileFailed,
    /// Size or properties over limits
    MessageIllegal,
    UnknownError,
}

/// Result returned to the producer
#[derive(Debug, Clone)]
pub struct PutMessageResult {
    pub status: PutMessageStatus,
    pub append_result: Option<AppendMessageResult>,
}

impl PutMessageResult {
    pub fn new(status: PutMessageStatus, append_result: Option<AppendMessageResult>) -> Self {
        Self {
            status,
            append_result,
        }
    }

    pub fn status_only(status: PutMessageStatus) -> Self {
        Self::new(status, None)
    }

    pub fn is_ok(&self) -> bool {
        self.status == PutMessageStatus::PutOk
    }
}
