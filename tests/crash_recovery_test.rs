//! Crash recovery tests for the commit log
//!
//! These tests simulate clean restarts and crashes by reopening stores over
//! the same directory, corrupting segment files on disk directly, and then
//! asserting what the recovery scans rebuild, dispatch and truncate.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use flowline::config::MessageStoreConfig;
use flowline::storage::{
    CommitLog, DispatchRequest, DispatchSink, Message, NoHaService, PutMessageStatus,
    StoreCheckpoint,
};
use parking_lot::Mutex;

/// Dispatch sink that records everything recovery replays into it
#[derive(Default)]
struct RecordingSink {
    dispatched: Mutex<Vec<DispatchRequest>>,
    truncated_at: AtomicI64,
    destroyed: AtomicBool,
}

impl DispatchSink for RecordingSink {
    fn dispatch(&self, request: &DispatchRequest) {
        self.dispatched.lock().push(request.clone());
    }

    fn truncate(&self, phy_offset: i64) {
        self.truncated_at.store(phy_offset, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

fn test_config(dir: &Path) -> MessageStoreConfig {
    MessageStoreConfig {
        commitlog_dir: dir.join("commitlog"),
        commitlog_file_size: 4096,
        ..MessageStoreConfig::default()
    }
}

fn open_commit_log(dir: &Path, sink: Arc<RecordingSink>) -> CommitLog {
    open_commit_log_with(test_config(dir), dir, sink)
}

fn open_commit_log_with(
    config: MessageStoreConfig,
    dir: &Path,
    sink: Arc<RecordingSink>,
) -> CommitLog {
    let checkpoint = Arc::new(StoreCheckpoint::open(dir.join("checkpoint")).unwrap());
    CommitLog::new(Arc::new(config), checkpoint, sink, Arc::new(NoHaService)).unwrap()
}

/// Append `count` records and return the append results
fn populate(log: &CommitLog, topic: &str, count: usize) -> Vec<(i64, i32)> {
    let mut appended = Vec::new();
    for i in 0..count {
        let mut msg = Message::new(topic, 0, Bytes::from(format!("payload-{i:04}")));
        let result = log.put_message(&mut msg);
        assert_eq!(result.status, PutMessageStatus::PutOk);
        let append = result.append_result.unwrap();
        appended.push((append.wrote_offset, append.wrote_bytes));
    }
    appended
}

#[test]
fn test_normal_recovery_restores_watermarks_and_queue_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let total_bytes;
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        // enough records to spill into a second segment
        populate(&log, "orders", 50);
        total_bytes = log.get_max_offset();
        log.flush();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_normally();

    assert_eq!(log.get_max_offset(), total_bytes);
    assert_eq!(log.remain_how_many_data_to_flush(), total_bytes - log.flush());
    assert_eq!(log.flush(), total_bytes);
    assert_eq!(log.next_queue_offset("orders", 0), 50);

    // appends continue exactly where the log left off
    let mut msg = Message::new("orders", 0, Bytes::from_static(b"after-restart"));
    let result = log.put_message(&mut msg);
    assert_eq!(result.append_result.unwrap().wrote_offset, total_bytes);
}

#[test]
fn test_normal_recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        populate(&log, "orders", 10);
        log.flush();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_normally();
    let first_max = log.get_max_offset();
    let first_flushed = log.flush();

    log.recover_normally();
    assert_eq!(log.get_max_offset(), first_max);
    assert_eq!(log.flush(), first_flushed);
}

#[test]
fn test_abnormal_recovery_truncates_torn_record_and_redispatches() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let appended;
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        appended = populate(&log, "orders", 8);
        log.flush();
    }

    // crash mid-write: the last record's bytes past its size field never
    // made it to disk
    let (last_offset, last_size) = *appended.last().unwrap();
    let segment = dir.path().join("commitlog").join("00000000000000000000");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap();
        file.seek(SeekFrom::Start(last_offset as u64 + 4)).unwrap();
        file.write_all(&vec![0u8; last_size as usize - 4]).unwrap();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_abnormally();

    // the scan stopped at the last well-formed record
    assert_eq!(log.get_max_offset(), last_offset);
    assert_eq!(log.flush(), last_offset);
    assert_eq!(sink.truncated_at.load(Ordering::SeqCst), last_offset);

    // the seven surviving records were re-dispatched in physical order
    let dispatched = sink.dispatched.lock();
    assert_eq!(dispatched.len(), 7);
    for (request, (offset, _)) in dispatched.iter().zip(&appended) {
        assert_eq!(request.commit_log_offset, *offset);
        assert_eq!(request.topic, "orders");
    }
    drop(dispatched);

    // the torn record no longer consumes a queue slot
    assert_eq!(log.next_queue_offset("orders", 0), 7);
}

#[test]
fn test_abnormal_recovery_spans_blank_trailers() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let total_bytes;
    let count = 40; // spills into a second segment via a blank trailer
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        populate(&log, "orders", count);
        total_bytes = log.get_max_offset();
        assert!(total_bytes > 4096);
        log.flush();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_abnormally();

    assert_eq!(log.get_max_offset(), total_bytes);
    assert_eq!(sink.dispatched.lock().len(), count);
    assert_eq!(sink.truncated_at.load(Ordering::SeqCst), total_bytes);
}

#[test]
fn test_abnormal_recovery_duplication_mode_gates_on_confirm_offset() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let appended;
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        appended = populate(&log, "orders", 5);
        log.flush();
    }

    let config = MessageStoreConfig {
        duplication_enable: true,
        ..test_config(dir.path())
    };
    let log = open_commit_log_with(config, dir.path(), Arc::clone(&sink));
    assert!(log.load());
    // only the first two records are confirmed replicated
    log.set_confirm_offset(appended[2].0);
    log.recover_abnormally();

    let dispatched = sink.dispatched.lock();
    assert_eq!(dispatched.len(), 2);
    assert!(dispatched
        .iter()
        .all(|request| request.commit_log_offset < appended[2].0));
}

#[test]
fn test_abnormal_recovery_of_empty_store_destroys_logical_structures() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_abnormally();

    assert!(sink.destroyed.load(Ordering::SeqCst));
    assert_eq!(log.get_max_offset(), 0);
    assert_eq!(log.flush(), 0);
}

#[test]
fn test_recovery_stops_at_mid_log_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let appended;
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        appended = populate(&log, "orders", 6);
        log.flush();
    }

    // corrupt the magic of the third record
    let (third_offset, _) = appended[2];
    let segment = dir.path().join("commitlog").join("00000000000000000000");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap();
        file.seek(SeekFrom::Start(third_offset as u64 + 4)).unwrap();
        file.write_all(&0xBADC_0DE5u32.to_be_bytes()).unwrap();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_normally();

    // everything from the corrupt record on is discarded
    assert_eq!(log.get_max_offset(), third_offset);
    assert_eq!(log.next_queue_offset("orders", 0), 2);
}

#[test]
fn test_crc_corruption_detected_during_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let appended;
    {
        let log = open_commit_log(dir.path(), Arc::clone(&sink));
        appended = populate(&log, "orders", 3);
        log.flush();
    }

    // flip one body byte of the second record; its CRC no longer matches
    let (second_offset, _) = appended[1];
    let segment = dir.path().join("commitlog").join("00000000000000000000");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap();
        // body starts at +88 within the record
        file.seek(SeekFrom::Start(second_offset as u64 + 90)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    let log = open_commit_log(dir.path(), Arc::clone(&sink));
    assert!(log.load());
    log.recover_normally();
    assert_eq!(log.get_max_offset(), second_offset);

    // with CRC checking disabled the scan sails past the bit flip
    let sink2 = Arc::new(RecordingSink::default());
    let config = MessageStoreConfig {
        check_crc_on_recover: false,
        ..test_config(dir.path())
    };
    let log = open_commit_log_with(config, dir.path(), sink2);
    assert!(log.load());
    log.recover_normally();
    assert!(log.get_max_offset() > second_offset);
}

#[test]
fn test_reset_offset_rewinds_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let log = open_commit_log(dir.path(), sink);

    let appended = populate(&log, "orders", 4);
    let (third_offset, _) = appended[2];

    assert!(log.reset_offset(third_offset));
    assert_eq!(log.get_max_offset(), third_offset);

    // the next append lands where the log was cut
    let mut msg = Message::new("orders", 0, Bytes::from_static(b"rewritten"));
    let result = log.put_message(&mut msg);
    assert_eq!(result.append_result.unwrap().wrote_offset, third_offset);
}

#[test]
fn test_destroy_removes_all_segments() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let log = open_commit_log(dir.path(), sink);

    populate(&log, "orders", 3);
    assert!(dir
        .path()
        .join("commitlog")
        .join("00000000000000000000")
        .exists());

    log.destroy();
    assert_eq!(log.get_max_offset(), 0);
    assert!(!dir
        .path()
        .join("commitlog")
        .join("00000000000000000000")
        .exists());
}
