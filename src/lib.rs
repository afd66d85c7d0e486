#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Flowline
//!
//! Flowline is the append-only persistent commit log at the core of the
//! Flowline message broker. Producers hand records to the broker; the
//! commit log serializes them into a contiguous byte stream over fixed-size
//! memory-mapped segment files and acknowledges once the configured
//! durability policy is satisfied: synchronous group commit, asynchronous
//! interval flushing, or replication to a follower.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use flowline::config::MessageStoreConfig;
//! use flowline::storage::{
//!     CommitLog, Message, NoHaService, NoopDispatchSink, StoreCheckpoint,
//! };
//!
//! fn main() -> flowline::Result<()> {
//!     let config = Arc::new(MessageStoreConfig::with_dir("./store/commitlog"));
//!     let checkpoint = Arc::new(StoreCheckpoint::open("./store/checkpoint")?);
//!     let commit_log = CommitLog::new(
//!         config,
//!         checkpoint,
//!         Arc::new(NoopDispatchSink),
//!         Arc::new(NoHaService),
//!     )?;
//!
//!     commit_log.load();
//!     commit_log.recover_normally();
//!     commit_log.start();
//!
//!     let mut msg = Message::new("orders", 0, Bytes::from("hello"));
//!     let result = commit_log.put_message(&mut msg);
//!     println!("stored at {:?}", result.append_result.map(|r| r.wrote_offset));
//!
//!     commit_log.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`storage::CommitLog`] — append engine, read path, recovery,
//!   operational surface
//! - [`storage::mapped_file`] / [`storage::mapped_queue`] — mmap-backed
//!   fixed-size segments and the segment list
//! - [`storage::flush`] — group-commit, interval-flush and commit services
//! - [`storage::record`] / [`storage::batch`] — the on-disk record codec
//!   and the producer batch encoder
//! - [`config`] — serde-backed store configuration
//! - [`error`] — crate error types

pub mod config;
pub mod error;
pub mod storage;

pub use error::{FlowlineError, Result};
pub use storage::CommitLog;
