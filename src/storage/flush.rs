//! Durability services
//!
//! Three long-running workers cooperate on making appended bytes durable:
//!
//! - [`GroupCommitService`] serves synchronous-flush mode. Producers park
//!   on a latch; the service coalesces all waiters that arrived while the
//!   previous fsync ran, flushes once, and wakes them together.
//! - [`FlushRealTimeService`] serves asynchronous-flush mode with a
//!   time/page-threshold driven loop.
//! - [`CommitRealTimeService`] runs only with the transient buffer pool,
//!   draining staged bytes into the mapped region ahead of the flusher.
//!
//! Each service owns a signalable wait point; producers wake it instead of
//! flushing inline, so durability waits never happen under the append lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::config::{MessageStoreConfig, SLOW_FLUSH_WARN_MS};
use crate::storage::checkpoint::StoreCheckpoint;
use crate::storage::mapped_queue::MappedFileQueue;
use crate::storage::now_millis;

/// Shutdown drain attempts before a service gives up
const RETRY_TIMES_OVER: usize = 10;

/// Interval of the group-commit wait loop
const GROUP_COMMIT_WAIT_MS: u64 = 10;

/// Signalable wait point shared by a service and its wakers
///
/// A wakeup arriving while the service is busy is latched in `notified`, so
/// the next wait returns immediately instead of sleeping a full interval.
pub struct WaitPoint {
    notified: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WaitPoint {
    pub fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn wakeup(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }

    /// Park for at most `timeout`, returning early on a wakeup
    pub fn wait_for_running(&self, timeout: Duration) {
        if self
            .notified
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        let mut guard = self.lock.lock();
        if self
            .notified
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.notified.store(false, Ordering::Release);
    }
}

impl Default for WaitPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-use completion latch a producer parks on
pub struct FlushLatch {
    state: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl FlushLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub fn complete(&self, ok: bool) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(ok);
        }
        self.condvar.notify_all();
    }

    /// Wait for completion; false on timeout or a failed flush
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if let Some(ok) = *state {
            return ok;
        }
        self.condvar.wait_for(&mut state, timeout);
        state.unwrap_or(false)
    }
}

impl Default for FlushLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// A producer's request to be woken once bytes up to `next_offset` are
/// durable (locally, or on a follower when used by the replication bridge)
pub struct GroupCommitRequest {
    next_offset: i64,
    latch: Arc<FlushLatch>,
}

impl GroupCommitRequest {
    pub fn new(next_offset: i64) -> Self {
        Self {
            next_offset,
            latch: Arc::new(FlushLatch::new()),
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Latch handle the submitting producer parks on
    pub fn latch(&self) -> Arc<FlushLatch> {
        Arc::clone(&self.latch)
    }

    pub fn wakeup_customer(&self, flush_ok: bool) {
        self.latch.complete(flush_ok);
    }
}

/// Synchronous-flush service: coalesce waiters, flush once, wake them
pub struct GroupCommitService {
    queue: Arc<MappedFileQueue>,
    checkpoint: Arc<StoreCheckpoint>,
    requests_write: Mutex<Vec<GroupCommitRequest>>,
    requests_read: Mutex<Vec<GroupCommitRequest>>,
    wait_point: Arc<WaitPoint>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCommitService {
    pub fn new(queue: Arc<MappedFileQueue>, checkpoint: Arc<StoreCheckpoint>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            checkpoint,
            requests_write: Mutex::new(Vec::new()),
            requests_read: Mutex::new(Vec::new()),
            wait_point: Arc::new(WaitPoint::new()),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn put_request(&self, request: GroupCommitRequest) {
        self.requests_write.lock().push(request);
        self.wait_point.wakeup();
    }

    pub fn wakeup(&self) {
        self.wait_point.wakeup();
    }

    /// Wait point handle for services that poke the group committer
    pub fn wait_point(&self) -> Arc<WaitPoint> {
        Arc::clone(&self.wait_point)
    }

    fn swap_requests(&self) {
        let mut write = self.requests_write.lock();
        let mut read = self.requests_read.lock();
        std::mem::swap(&mut *write, &mut *read);
    }

    fn do_commit(&self) {
        let mut read = self.requests_read.lock();
        if read.is_empty() {
            // messages marked async while the store runs in sync mode still
            // need the periodic flush
            self.queue.flush(0);
            return;
        }

        for request in read.iter() {
            // the record may straddle a segment boundary, so at most two
            // flushes per request
            let mut flush_ok = false;
            for _ in 0..2 {
                if flush_ok {
                    break;
                }
                flush_ok = self.queue.flushed_where() >= request.next_offset();
                if !flush_ok {
                    self.queue.flush(0);
                }
            }
            request.wakeup_customer(flush_ok);
        }

        let store_timestamp = self.queue.store_timestamp();
        if store_timestamp > 0 {
            self.checkpoint.set_physic_msg_timestamp(store_timestamp);
        }
        read.clear();
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("group-commit".to_string())
            .spawn(move || service.run())
            .unwrap_or_else(|e| {
                error!(error = %e, "spawn group-commit service failed");
                panic!("spawn group-commit service: {e}");
            });
        *self.handle.lock() = Some(handle);
    }

    fn run(&self) {
        info!("group-commit service started");
        while !self.stopped.load(Ordering::Acquire) {
            self.wait_point
                .wait_for_running(Duration::from_millis(GROUP_COMMIT_WAIT_MS));
            self.swap_requests();
            self.do_commit();
        }

        // let straggling requests land, then drain one more pass
        std::thread::sleep(Duration::from_millis(GROUP_COMMIT_WAIT_MS));
        self.swap_requests();
        self.do_commit();
        info!("group-commit service end");
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wait_point.wakeup();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Asynchronous flush service: time/page-threshold driven loop
pub struct FlushRealTimeService {
    queue: Arc<MappedFileQueue>,
    checkpoint: Arc<StoreCheckpoint>,
    config: Arc<MessageStoreConfig>,
    wait_point: Arc<WaitPoint>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushRealTimeService {
    pub fn new(
        queue: Arc<MappedFileQueue>,
        checkpoint: Arc<StoreCheckpoint>,
        config: Arc<MessageStoreConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            checkpoint,
            config,
            wait_point: Arc::new(WaitPoint::new()),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn wakeup(&self) {
        self.wait_point.wakeup();
    }

    /// Wait point handle for services that poke the flusher
    pub fn wait_point(&self) -> Arc<WaitPoint> {
        Arc::clone(&self.wait_point)
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("flush-realtime".to_string())
            .spawn(move || service.run())
            .unwrap_or_else(|e| {
                error!(error = %e, "spawn flush service failed");
                panic!("spawn flush service: {e}");
            });
        *self.handle.lock() = Some(handle);
    }

    fn run(&self) {
        info!("flush service started");
        let mut last_flush_timestamp = 0i64;

        while !self.stopped.load(Ordering::Acquire) {
            let flush_timed = self.config.flush_timed;
            let interval = self.config.flush_interval_ms;
            let mut least_pages = self.config.flush_least_pages;
            let thorough_interval = self.config.flush_thorough_interval_ms as i64;

            // past the thorough interval, flush whatever is buffered
            let now = now_millis();
            if now >= last_flush_timestamp + thorough_interval {
                last_flush_timestamp = now;
                least_pages = 0;
            }

            if flush_timed {
                std::thread::sleep(Duration::from_millis(interval));
            } else {
                self.wait_point
                    .wait_for_running(Duration::from_millis(interval));
            }

            let begin = Instant::now();
            self.queue.flush(least_pages);
            let store_timestamp = self.queue.store_timestamp();
            if store_timestamp > 0 {
                self.checkpoint.set_physic_msg_timestamp(store_timestamp);
            }
            let past = begin.elapsed();
            if past.as_millis() as u64 > SLOW_FLUSH_WARN_MS {
                warn!(cost_ms = past.as_millis() as u64, "flush data to disk is slow");
            }
        }

        // normal shutdown: everything flushed before exit
        for i in 0..RETRY_TIMES_OVER {
            let progressed = self.queue.flush(0);
            info!(retry = i + 1, progressed, "flush service shutdown drain");
            if !progressed {
                break;
            }
        }
        info!("flush service end");
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wait_point.wakeup();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Commit service: drains transient buffers into the mapped region
pub struct CommitRealTimeService {
    queue: Arc<MappedFileQueue>,
    config: Arc<MessageStoreConfig>,
    /// Poked whenever a commit moved data, so the flusher runs promptly
    flush_wait_point: Arc<WaitPoint>,
    wait_point: Arc<WaitPoint>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommitRealTimeService {
    pub fn new(
        queue: Arc<MappedFileQueue>,
        config: Arc<MessageStoreConfig>,
        flush_wait_point: Arc<WaitPoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            config,
            flush_wait_point,
            wait_point: Arc::new(WaitPoint::new()),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn wakeup(&self) {
        self.wait_point.wakeup();
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("commit-realtime".to_string())
            .spawn(move || service.run())
            .unwrap_or_else(|e| {
                error!(error = %e, "spawn commit service failed");
                panic!("spawn commit service: {e}");
            });
        *self.handle.lock() = Some(handle);
    }

    fn run(&self) {
        info!("commit service started");
        let mut last_commit_timestamp = 0i64;

        while !self.stopped.load(Ordering::Acquire) {
            let interval = self.config.commit_interval_ms;
            let mut least_pages = self.config.commit_least_pages;
            let thorough_interval = self.config.commit_thorough_interval_ms as i64;

            let begin = now_millis();
            if begin >= last_commit_timestamp + thorough_interval {
                last_commit_timestamp = begin;
                least_pages = 0;
            }

            let start = Instant::now();
            let progressed = self.queue.commit(least_pages);
            if progressed {
                last_commit_timestamp = now_millis();
                self.flush_wait_point.wakeup();
            }
            let past = start.elapsed();
            if past.as_millis() as u64 > SLOW_FLUSH_WARN_MS {
                warn!(cost_ms = past.as_millis() as u64, "commit data to file is slow");
            }

            self.wait_point
                .wait_for_running(Duration::from_millis(interval));
        }

        for i in 0..RETRY_TIMES_OVER {
            let progressed = self.queue.commit(0);
            info!(retry = i + 1, progressed, "commit service shutdown drain");
            if !progressed {
                break;
            }
        }
        info!("commit service end");
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wait_point.wakeup();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wait_point_wakeup_before_wait_returns_immediately() {
        let point = WaitPoint::new();
        point.wakeup();
        let begin = Instant::now();
        point.wait_for_running(Duration::from_secs(5));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_point_times_out() {
        let point = WaitPoint::new();
        let begin = Instant::now();
        point.wait_for_running(Duration::from_millis(20));
        assert!(begin.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_latch_completion_and_timeout() {
        let latch = FlushLatch::new();
        assert!(!latch.wait(Duration::from_millis(5)));

        let latch = Arc::new(FlushLatch::new());
        let signaller = Arc::clone(&latch);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaller.complete(true);
        });
        assert!(latch.wait(Duration::from_secs(5)));
        // completion is sticky
        assert!(latch.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_group_commit_flushes_waiters() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MappedFileQueue::new(dir.path(), 4096, None));
        let checkpoint =
            Arc::new(StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap());

        let file = queue.get_last_mapped_file_or_create(0).unwrap();
        assert!(file.append_raw(&[9u8; 256]));

        let service = GroupCommitService::new(Arc::clone(&queue), checkpoint);
        service.start();

        let request = GroupCommitRequest::new(256);
        let latch = request.latch();
        service.put_request(request);
        assert!(latch.wait(Duration::from_secs(5)));
        assert!(queue.flushed_where() >= 256);

        service.shutdown();
    }

    #[test]
    fn test_group_commit_shutdown_drains_pending() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MappedFileQueue::new(dir.path(), 4096, None));
        let checkpoint =
            Arc::new(StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap());

        let file = queue.get_last_mapped_file_or_create(0).unwrap();
        assert!(file.append_raw(&[9u8; 64]));

        // request enqueued before the service thread ever runs
        let service = GroupCommitService::new(Arc::clone(&queue), checkpoint);
        let request = GroupCommitRequest::new(64);
        let latch = request.latch();
        service.put_request(request);

        service.start();
        service.shutdown();
        assert!(latch.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_flush_service_thorough_interval_flushes_everything() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MappedFileQueue::new(dir.path(), 4096, None));
        let checkpoint =
            Arc::new(StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap());
        let config = Arc::new(MessageStoreConfig {
            flush_interval_ms: 5,
            // page threshold would normally hold this small write back
            flush_least_pages: 4,
            flush_thorough_interval_ms: 0,
            ..MessageStoreConfig::with_dir(dir.path())
        });

        let file = queue.get_last_mapped_file_or_create(0).unwrap();
        assert!(file.append_raw(&[1u8; 100]));

        let service = FlushRealTimeService::new(Arc::clone(&queue), checkpoint, config);
        service.start();
        service.wakeup();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.flushed_where() < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.flushed_where(), 100);
        service.shutdown();
    }

    #[test]
    fn test_commit_service_moves_staged_bytes_and_wakes_flusher() {
        use crate::storage::mapped_file::TransientStorePool;

        let dir = tempdir().unwrap();
        let pool = Arc::new(TransientStorePool::new(2, 4096));
        let queue = Arc::new(MappedFileQueue::new(dir.path(), 4096, Some(pool)));
        let config = Arc::new(MessageStoreConfig {
            commit_interval_ms: 5,
            commit_least_pages: 0,
            commit_thorough_interval_ms: 0,
            transient_pool_enabled: true,
            ..MessageStoreConfig::with_dir(dir.path())
        });

        let file = queue.get_last_mapped_file_or_create(0).unwrap();
        assert!(file.append_raw(&[4u8; 512]));
        assert_eq!(queue.max_offset(), 0);

        let flush_point = Arc::new(WaitPoint::new());
        let service =
            CommitRealTimeService::new(Arc::clone(&queue), config, Arc::clone(&flush_point));
        service.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.committed_where() < 512 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.committed_where(), 512);
        assert_eq!(queue.max_offset(), 512);
        service.shutdown();
    }
}
