//! The commit log append engine
//!
//! All producer records for all topics land in one contiguous byte stream
//! backed by fixed-size mapped segments. A single append lock serializes
//! the critical section: timestamp assignment, segment selection and
//! rollover, queue-offset assignment, serialization and the write into the
//! mapped region. Durability and replication waits happen after the lock is
//! released, so one slow fsync never stalls other producers; the price is
//! that acknowledgements may complete out of append order.
//!
//! Collaborators are injected at construction: configuration, the store
//! checkpoint, the dispatch sink that rebuilds secondary indexes during
//! recovery, and the replication service. The engine never reaches past
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{BrokerRole, MessageStoreConfig, SLOW_APPEND_WARN_MS};
use crate::error::Result;
use crate::storage::batch::{read_i32_at, write_i64_at, BatchEncoder, MessageBatch};
use crate::storage::checkpoint::StoreCheckpoint;
use crate::storage::dispatch::DispatchSink;
use crate::storage::flush::{
    CommitRealTimeService, FlushRealTimeService, GroupCommitRequest, GroupCommitService,
};
use crate::storage::ha::HaService;
use crate::storage::lock::AppendLock;
use crate::storage::mapped_file::{MappedBuffer, MappedFile, TransientStorePool};
use crate::storage::mapped_queue::MappedFileQueue;
use crate::storage::message::{
    create_message_id, properties_to_string, sys_flag, Message, PROPERTY_REAL_QUEUE_ID,
    PROPERTY_REAL_TOPIC,
};
use crate::storage::now_millis;
use crate::storage::record::{
    cal_msg_length, check_message_and_return_size, encode_message, DispatchRequest,
    BLANK_MAGIC_CODE, END_FILE_MIN_BLANK_LENGTH, MESSAGE_MAGIC_CODE, MSG_MAGIC_POSITION,
    MSG_PHYSICAL_OFFSET_POSITION, MSG_QUEUE_OFFSET_POSITION, MSG_STORE_TIMESTAMP_POSITION,
};
use crate::storage::result::{
    AppendMessageResult, AppendMessageStatus, PutMessageResult, PutMessageStatus,
};
use crate::storage::schedule::{DelayLevelTable, SCHEDULE_TOPIC};

enum FlushService {
    GroupCommit(Arc<GroupCommitService>),
    Realtime(Arc<FlushRealTimeService>),
}

fn topic_queue_key(topic: &str, queue_id: i32) -> String {
    format!("{topic}-{queue_id}")
}

pub struct CommitLog {
    config: Arc<MessageStoreConfig>,
    mapped_file_queue: Arc<MappedFileQueue>,
    checkpoint: Arc<StoreCheckpoint>,
    dispatch: Arc<dyn DispatchSink>,
    ha_service: Arc<dyn HaService>,
    delay_levels: DelayLevelTable,
    flush_service: FlushService,
    commit_service: Arc<CommitRealTimeService>,
    /// topic-queueid -> next queue offset to assign; mutated only under the
    /// append lock (removal has its own critical section)
    topic_queue_table: Mutex<HashMap<String, i64>>,
    /// Highest physical offset known replicated
    confirm_offset: AtomicI64,
    /// Set while an appender holds the lock; 0 otherwise
    begin_time_in_lock: AtomicI64,
    append_lock: AppendLock,
    /// Record serialization buffer; taken inside the append lock, so this
    /// is one scratch per (serialized) appender with no per-append
    /// allocation
    append_scratch: Mutex<Vec<u8>>,
    batch_encoders: Mutex<Vec<BatchEncoder>>,
}

impl CommitLog {
    pub fn new(
        config: Arc<MessageStoreConfig>,
        checkpoint: Arc<StoreCheckpoint>,
        dispatch: Arc<dyn DispatchSink>,
        ha_service: Arc<dyn HaService>,
    ) -> Result<Self> {
        let delay_levels = DelayLevelTable::parse(&config.delay_levels)?;

        let transient_pool = if config.transient_pool_enabled {
            Some(Arc::new(TransientStorePool::new(
                config.transient_pool_buffers,
                config.commitlog_file_size,
            )))
        } else {
            None
        };
        let mapped_file_queue = Arc::new(MappedFileQueue::new(
            config.commitlog_dir.clone(),
            config.commitlog_file_size,
            transient_pool,
        ));

        let flush_service = if config.is_sync_flush() {
            FlushService::GroupCommit(GroupCommitService::new(
                Arc::clone(&mapped_file_queue),
                Arc::clone(&checkpoint),
            ))
        } else {
            FlushService::Realtime(FlushRealTimeService::new(
                Arc::clone(&mapped_file_queue),
                Arc::clone(&checkpoint),
                Arc::clone(&config),
            ))
        };
        let flush_wait_point = match &flush_service {
            FlushService::GroupCommit(service) => service.wait_point(),
            FlushService::Realtime(service) => service.wait_point(),
        };
        let commit_service = CommitRealTimeService::new(
            Arc::clone(&mapped_file_queue),
            Arc::clone(&config),
            flush_wait_point,
        );

        let scratch_capacity = config.max_message_bytes + END_FILE_MIN_BLANK_LENGTH;
        Ok(Self {
            mapped_file_queue,
            checkpoint,
            dispatch,
            ha_service,
            delay_levels,
            flush_service,
            commit_service,
            topic_queue_table: Mutex::new(HashMap::new()),
            confirm_offset: AtomicI64::new(-1),
            begin_time_in_lock: AtomicI64::new(0),
            append_lock: AppendLock::new(config.use_mutex_append_lock),
            append_scratch: Mutex::new(Vec::with_capacity(scratch_capacity)),
            batch_encoders: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Map the segment files already on disk
    pub fn load(&self) -> bool {
        let result = self.mapped_file_queue.load();
        info!(ok = result, "load commit log");
        result
    }

    /// Start the configured durability services
    pub fn start(&self) {
        match &self.flush_service {
            FlushService::GroupCommit(service) => service.start(),
            FlushService::Realtime(service) => service.start(),
        }
        if self.config.transient_pool_enabled {
            self.commit_service.start();
        }
    }

    pub fn shutdown(&self) {
        if self.config.transient_pool_enabled {
            self.commit_service.shutdown();
        }
        match &self.flush_service {
            FlushService::GroupCommit(service) => service.shutdown(),
            FlushService::Realtime(service) => service.shutdown(),
        }
    }

    /// Commit and flush everything buffered; returns the flush watermark
    pub fn flush(&self) -> i64 {
        self.mapped_file_queue.commit(0);
        self.mapped_file_queue.flush(0);
        self.mapped_file_queue.flushed_where()
    }

    pub fn get_max_offset(&self) -> i64 {
        self.mapped_file_queue.max_offset()
    }

    /// First readable physical offset, skipping segments already retired
    pub fn get_min_offset(&self) -> i64 {
        let files = self.mapped_file_queue.mapped_files();
        let Some(first) = files.first() else {
            return -1;
        };
        // consecutive retiring segments roll forward to the next live one
        for file in &files {
            if file.is_available() {
                return file.file_from_offset();
            }
        }
        self.roll_next_file(first.file_from_offset())
    }

    /// Start offset of the segment after the one containing `offset`
    pub fn roll_next_file(&self, offset: i64) -> i64 {
        let size = self.config.commitlog_file_size as i64;
        offset + size - offset % size
    }

    pub fn remain_how_many_data_to_commit(&self) -> i64 {
        self.mapped_file_queue.remain_how_many_data_to_commit()
    }

    pub fn remain_how_many_data_to_flush(&self) -> i64 {
        self.mapped_file_queue.remain_how_many_data_to_flush()
    }

    pub fn confirm_offset(&self) -> i64 {
        self.confirm_offset.load(Ordering::Acquire)
    }

    pub fn set_confirm_offset(&self, phy_offset: i64) {
        self.confirm_offset.store(phy_offset, Ordering::Release);
    }

    /// Elapsed in-lock time of the current appender, 0 when idle
    pub fn lock_time_mills(&self) -> i64 {
        let begin = self.begin_time_in_lock.load(Ordering::Acquire);
        if begin > 0 {
            (now_millis() - begin).max(0)
        } else {
            0
        }
    }

    /// Next queue offset that would be assigned for (topic, queue)
    pub fn next_queue_offset(&self, topic: &str, queue_id: i32) -> i64 {
        self.topic_queue_table
            .lock()
            .get(&topic_queue_key(topic, queue_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn remove_queue_from_topic_queue_table(&self, topic: &str, queue_id: i32) {
        let key = topic_queue_key(topic, queue_id);
        self.topic_queue_table.lock().remove(&key);
        info!(topic, queue_id, "removed queue from topic queue table");
    }

    fn rewrite_for_scheduled_delivery(&self, msg: &mut Message) {
        let level = self.delay_levels.clamp_level(msg.delay_level);
        // keep the real destination so the schedule service can restore it
        msg.properties
            .insert(PROPERTY_REAL_TOPIC.to_string(), msg.topic.clone());
        msg.properties
            .insert(PROPERTY_REAL_QUEUE_ID.to_string(), msg.queue_id.to_string());
        msg.properties
            .insert(crate::storage::message::PROPERTY_DELAY.to_string(), level.to_string());
        msg.topic = SCHEDULE_TOPIC.to_string();
        msg.queue_id = DelayLevelTable::delay_level_to_queue_id(level);
        msg.delay_level = level;
    }

    /// Append a single record, then satisfy the durability and replication
    /// policies
    pub fn put_message(&self, msg: &mut Message) -> PutMessageResult {
        msg.store_timestamp = now_millis();
        // CRC on the caller thread, outside the lock
        msg.body_crc = crc32fast::hash(&msg.body);

        let tran_type = msg.transaction_type();
        if (tran_type == sys_flag::TRANSACTION_NOT_TYPE
            || tran_type == sys_flag::TRANSACTION_COMMIT_TYPE)
            && msg.delay_level > 0
        {
            self.rewrite_for_scheduled_delivery(msg);
        }
        let properties = properties_to_string(&msg.properties);

        let mut mapped_file = self.mapped_file_queue.get_last_mapped_file();
        let result;
        let elapsed;
        {
            let _guard = self.append_lock.lock();
            let begin_lock_timestamp = now_millis();
            self.begin_time_in_lock
                .store(begin_lock_timestamp, Ordering::Release);
            // assigned under the lock so store timestamps are globally
            // ordered
            msg.store_timestamp = begin_lock_timestamp;

            if mapped_file.as_ref().map_or(true, |f| f.is_full()) {
                mapped_file = self.mapped_file_queue.get_last_mapped_file_or_create(0);
            }
            let Some(mut file) = mapped_file else {
                error!(topic = %msg.topic, "create segment for append failed");
                self.begin_time_in_lock.store(0, Ordering::Release);
                return PutMessageResult::status_only(PutMessageStatus::CreateMappedFileFailed);
            };

            let mut attempt = self.do_append_single(&file, msg, &properties);
            if attempt.status == AppendMessageStatus::EndOfFile {
                // the record goes in a fresh segment; one retry only
                match self.mapped_file_queue.get_last_mapped_file_or_create(0) {
                    Some(next) => {
                        file = next;
                        attempt = self.do_append_single(&file, msg, &properties);
                    }
                    None => {
                        error!(topic = %msg.topic, "create segment after rollover failed");
                        self.begin_time_in_lock.store(0, Ordering::Release);
                        return PutMessageResult::new(
                            PutMessageStatus::CreateMappedFileFailed,
                            Some(attempt),
                        );
                    }
                }
            }

            match attempt.status {
                AppendMessageStatus::PutOk => {}
                AppendMessageStatus::EndOfFile => {
                    error!("segment rolled over twice within one append");
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    return PutMessageResult::new(PutMessageStatus::UnknownError, Some(attempt));
                }
                AppendMessageStatus::MessageSizeExceeded
                | AppendMessageStatus::PropertiesSizeExceeded => {
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    return PutMessageResult::new(PutMessageStatus::MessageIllegal, Some(attempt));
                }
                AppendMessageStatus::UnknownError => {
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    return PutMessageResult::new(PutMessageStatus::UnknownError, Some(attempt));
                }
            }

            elapsed = now_millis() - begin_lock_timestamp;
            self.begin_time_in_lock.store(0, Ordering::Release);
            result = attempt;
        }

        if elapsed > SLOW_APPEND_WARN_MS {
            warn!(
                elapsed_ms = elapsed,
                body_len = msg.body.len(),
                "append held the lock too long"
            );
        }

        let mut put_result = PutMessageResult::new(PutMessageStatus::PutOk, Some(result.clone()));
        self.handle_disk_flush(&result, &mut put_result, msg.wait_store_ok);
        self.handle_ha(&result, &mut put_result, msg.wait_store_ok);
        put_result
    }

    /// Append a pre-encoded batch; transactions and delays are not
    /// supported for batches
    pub fn put_messages(&self, batch: &mut MessageBatch) -> PutMessageResult {
        batch.store_timestamp = now_millis();

        if sys_flag::transaction_type(batch.sys_flag) != sys_flag::TRANSACTION_NOT_TYPE {
            return PutMessageResult::status_only(PutMessageStatus::MessageIllegal);
        }
        if batch.delay_level > 0 {
            return PutMessageResult::status_only(PutMessageStatus::MessageIllegal);
        }

        // encode on the caller thread with a leased encoder
        let mut encoder = self
            .batch_encoders
            .lock()
            .pop()
            .unwrap_or_else(|| BatchEncoder::new(self.config.max_message_bytes));
        if let Err(e) = encoder.encode(batch) {
            warn!(error = ?e, topic = %batch.topic, "batch rejected before append");
            self.batch_encoders.lock().push(encoder);
            return PutMessageResult::status_only(PutMessageStatus::MessageIllegal);
        }

        let mut mapped_file = self.mapped_file_queue.get_last_mapped_file();
        let result;
        let elapsed;
        {
            let _guard = self.append_lock.lock();
            let begin_lock_timestamp = now_millis();
            self.begin_time_in_lock
                .store(begin_lock_timestamp, Ordering::Release);
            batch.store_timestamp = begin_lock_timestamp;

            if mapped_file.as_ref().map_or(true, |f| f.is_full()) {
                mapped_file = self.mapped_file_queue.get_last_mapped_file_or_create(0);
            }
            let Some(mut file) = mapped_file else {
                error!(topic = %batch.topic, "create segment for batch append failed");
                self.begin_time_in_lock.store(0, Ordering::Release);
                self.batch_encoders.lock().push(encoder);
                return PutMessageResult::status_only(PutMessageStatus::CreateMappedFileFailed);
            };

            let mut attempt = self.do_append_batch(&file, batch, &mut encoder);
            if attempt.status == AppendMessageStatus::EndOfFile {
                match self.mapped_file_queue.get_last_mapped_file_or_create(0) {
                    Some(next) => {
                        file = next;
                        attempt = self.do_append_batch(&file, batch, &mut encoder);
                    }
                    None => {
                        error!(topic = %batch.topic, "create segment after batch rollover failed");
                        self.begin_time_in_lock.store(0, Ordering::Release);
                        self.batch_encoders.lock().push(encoder);
                        return PutMessageResult::new(
                            PutMessageStatus::CreateMappedFileFailed,
                            Some(attempt),
                        );
                    }
                }
            }

            match attempt.status {
                AppendMessageStatus::PutOk => {}
                AppendMessageStatus::EndOfFile => {
                    error!("segment rolled over twice within one batch append");
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    self.batch_encoders.lock().push(encoder);
                    return PutMessageResult::new(PutMessageStatus::UnknownError, Some(attempt));
                }
                AppendMessageStatus::MessageSizeExceeded
                | AppendMessageStatus::PropertiesSizeExceeded => {
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    self.batch_encoders.lock().push(encoder);
                    return PutMessageResult::new(PutMessageStatus::MessageIllegal, Some(attempt));
                }
                AppendMessageStatus::UnknownError => {
                    self.begin_time_in_lock.store(0, Ordering::Release);
                    self.batch_encoders.lock().push(encoder);
                    return PutMessageResult::new(PutMessageStatus::UnknownError, Some(attempt));
                }
            }

            elapsed = now_millis() - begin_lock_timestamp;
            self.begin_time_in_lock.store(0, Ordering::Release);
            result = attempt;
        }
        self.batch_encoders.lock().push(encoder);

        if elapsed > SLOW_APPEND_WARN_MS {
            warn!(elapsed_ms = elapsed, "batch append held the lock too long");
        }

        let mut put_result = PutMessageResult::new(PutMessageStatus::PutOk, Some(result.clone()));
        self.handle_disk_flush(&result, &mut put_result, batch.wait_store_ok);
        self.handle_ha(&result, &mut put_result, batch.wait_store_ok);
        put_result
    }

    /// Raw replication ingress: append pre-formatted bytes at
    /// `start_offset`
    pub fn append_data(&self, start_offset: i64, data: &[u8]) -> bool {
        let _guard = self.append_lock.lock();
        let Some(file) = self
            .mapped_file_queue
            .get_last_mapped_file_or_create(start_offset)
        else {
            error!(start_offset, "append data: no segment");
            return false;
        };
        file.append_raw(data)
    }

    fn do_append_single(
        &self,
        file: &Arc<MappedFile>,
        msg: &Message,
        properties: &str,
    ) -> AppendMessageResult {
        let mut table = self.topic_queue_table.lock();
        let mut scratch = self.append_scratch.lock();
        let max_message_bytes = self.config.max_message_bytes;

        file.append_message(|file_from_offset, wrote_pos, region| {
            let max_blank = region.len();
            let wrote_offset = file_from_offset + wrote_pos as i64;
            let msg_id = create_message_id(msg.store_host, wrote_offset);

            let key = topic_queue_key(&msg.topic, msg.queue_id);
            let current_offset = *table.entry(key.clone()).or_insert(0);
            let tran_type = msg.transaction_type();
            // prepared and rollback records do not consume a queue slot
            let queue_offset = match tran_type {
                sys_flag::TRANSACTION_PREPARED_TYPE | sys_flag::TRANSACTION_ROLLBACK_TYPE => 0,
                _ => current_offset,
            };

            if properties.len() > i16::MAX as usize {
                warn!(len = properties.len(), "message properties too long");
                return AppendMessageResult::status_only(
                    AppendMessageStatus::PropertiesSizeExceeded,
                );
            }
            if msg.topic.len() > u8::MAX as usize {
                warn!(len = msg.topic.len(), "topic too long");
                return AppendMessageResult::status_only(AppendMessageStatus::MessageSizeExceeded);
            }
            let msg_len =
                cal_msg_length(msg.body.len() as i32, msg.topic.len(), properties.len());
            if msg_len as usize > max_message_bytes {
                warn!(
                    msg_len,
                    body_len = msg.body.len(),
                    max = max_message_bytes,
                    "message size exceeded"
                );
                return AppendMessageResult::status_only(AppendMessageStatus::MessageSizeExceeded);
            }

            if msg_len as usize + END_FILE_MIN_BLANK_LENGTH > max_blank {
                // close the segment with a blank record spanning the slack
                region[0..4].copy_from_slice(&(max_blank as i32).to_be_bytes());
                region[4..8].copy_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
                return AppendMessageResult {
                    status: AppendMessageStatus::EndOfFile,
                    wrote_offset,
                    wrote_bytes: max_blank as i32,
                    msg_id,
                    store_timestamp: msg.store_timestamp,
                    logics_offset: queue_offset,
                    msg_num: 0,
                };
            }

            scratch.clear();
            let written = encode_message(&mut scratch, msg, properties, queue_offset, wrote_offset);
            debug_assert_eq!(written, msg_len as usize);
            region[..written].copy_from_slice(&scratch);

            match tran_type {
                sys_flag::TRANSACTION_PREPARED_TYPE | sys_flag::TRANSACTION_ROLLBACK_TYPE => {}
                _ => {
                    table.insert(key, queue_offset + 1);
                }
            }

            AppendMessageResult {
                status: AppendMessageStatus::PutOk,
                wrote_offset,
                wrote_bytes: msg_len,
                msg_id,
                store_timestamp: msg.store_timestamp,
                logics_offset: queue_offset,
                msg_num: 1,
            }
        })
    }

    fn do_append_batch(
        &self,
        file: &Arc<MappedFile>,
        batch: &MessageBatch,
        encoder: &mut BatchEncoder,
    ) -> AppendMessageResult {
        let mut table = self.topic_queue_table.lock();
        let encoded = encoder.buffer_mut();

        file.append_message(|file_from_offset, wrote_pos, region| {
            let max_blank = region.len();
            let wrote_offset = file_from_offset + wrote_pos as i64;

            let key = topic_queue_key(&batch.topic, batch.queue_id);
            let mut queue_offset = *table.entry(key.clone()).or_insert(0);
            let begin_queue_offset = queue_offset;

            let mut total_len = 0usize;
            let mut msg_num = 0;
            let mut msg_ids = String::new();

            let mut pos = 0usize;
            while pos < encoded.len() {
                let msg_len = read_i32_at(encoded, pos) as usize;
                total_len += msg_len;

                if total_len + END_FILE_MIN_BLANK_LENGTH > max_blank {
                    // abandon the partially patched records; the whole
                    // batch retries in the next segment and the queue
                    // table was never advanced
                    region[0..4].copy_from_slice(&(max_blank as i32).to_be_bytes());
                    region[4..8].copy_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
                    return AppendMessageResult {
                        status: AppendMessageStatus::EndOfFile,
                        wrote_offset,
                        wrote_bytes: max_blank as i32,
                        msg_id: msg_ids,
                        store_timestamp: batch.store_timestamp,
                        logics_offset: begin_queue_offset,
                        msg_num: 0,
                    };
                }

                let physical_offset = wrote_offset + (total_len - msg_len) as i64;
                write_i64_at(encoded, pos + MSG_QUEUE_OFFSET_POSITION, queue_offset);
                write_i64_at(encoded, pos + MSG_PHYSICAL_OFFSET_POSITION, physical_offset);
                write_i64_at(
                    encoded,
                    pos + MSG_STORE_TIMESTAMP_POSITION,
                    batch.store_timestamp,
                );

                let msg_id = create_message_id(batch.store_host, physical_offset);
                if !msg_ids.is_empty() {
                    msg_ids.push(',');
                }
                msg_ids.push_str(&msg_id);

                queue_offset += 1;
                msg_num += 1;
                pos += msg_len;
            }

            // one bulk transfer of the fully patched batch
            region[..total_len].copy_from_slice(&encoded[..total_len]);
            table.insert(key, queue_offset);

            AppendMessageResult {
                status: AppendMessageStatus::PutOk,
                wrote_offset,
                wrote_bytes: total_len as i32,
                msg_id: msg_ids,
                store_timestamp: batch.store_timestamp,
                logics_offset: begin_queue_offset,
                msg_num,
            }
        })
    }

    fn handle_disk_flush(
        &self,
        result: &AppendMessageResult,
        put_result: &mut PutMessageResult,
        wait_store_ok: bool,
    ) {
        match &self.flush_service {
            FlushService::GroupCommit(service) => {
                if wait_store_ok {
                    let request =
                        GroupCommitRequest::new(result.wrote_offset + result.wrote_bytes as i64);
                    let latch = request.latch();
                    service.put_request(request);
                    let flush_ok =
                        latch.wait(Duration::from_millis(self.config.sync_flush_timeout_ms));
                    if !flush_ok {
                        error!(
                            next_offset = result.wrote_offset + result.wrote_bytes as i64,
                            "group commit wait for flush failed"
                        );
                        put_result.status = PutMessageStatus::FlushDiskTimeout;
                    }
                } else {
                    service.wakeup();
                }
            }
            FlushService::Realtime(service) => {
                if self.config.transient_pool_enabled {
                    self.commit_service.wakeup();
                } else {
                    service.wakeup();
                }
            }
        }
    }

    fn handle_ha(
        &self,
        result: &AppendMessageResult,
        put_result: &mut PutMessageResult,
        wait_store_ok: bool,
    ) {
        if self.config.broker_role != BrokerRole::SyncMaster || !wait_store_ok {
            return;
        }

        let next_offset = result.wrote_offset + result.wrote_bytes as i64;
        if self.ha_service.is_slave_ok(next_offset) {
            let request = GroupCommitRequest::new(next_offset);
            let latch = request.latch();
            self.ha_service.put_request(request);
            self.ha_service.wakeup_transfer();
            let transfer_ok =
                latch.wait(Duration::from_millis(self.config.sync_flush_timeout_ms));
            if !transfer_ok {
                error!(next_offset, "sync transfer to follower failed or timed out");
                put_result.status = PutMessageStatus::FlushSlaveTimeout;
            }
        } else {
            put_result.status = PutMessageStatus::SlaveNotAvailable;
        }
    }

    /// Fetch a record slice; `size` must cover the whole record
    pub fn get_message(&self, offset: i64, size: usize) -> Option<MappedBuffer> {
        let mapped_file_size = self.config.commitlog_file_size;
        let file = self
            .mapped_file_queue
            .find_mapped_file_by_offset(offset, offset == 0)?;
        let pos = (offset % mapped_file_size as i64) as usize;
        file.slice_from_size(pos, size)
    }

    /// All readable bytes from `offset` to the end of its segment
    pub fn get_data(&self, offset: i64) -> Option<MappedBuffer> {
        self.get_data_with_option(offset, offset == 0)
    }

    pub fn get_data_with_option(
        &self,
        offset: i64,
        return_first_on_not_found: bool,
    ) -> Option<MappedBuffer> {
        let mapped_file_size = self.config.commitlog_file_size;
        let file = self
            .mapped_file_queue
            .find_mapped_file_by_offset(offset, return_first_on_not_found)?;
        let pos = (offset % mapped_file_size as i64) as usize;
        file.slice_from(pos)
    }

    /// Store timestamp of the record at `offset` without a full decode
    pub fn pickup_store_timestamp(&self, offset: i64, size: usize) -> Option<i64> {
        if offset < self.get_min_offset() {
            return None;
        }
        let buffer = self.get_message(offset, size)?;
        let bytes = buffer.as_slice();
        if bytes.len() < MSG_STORE_TIMESTAMP_POSITION + 8 {
            return None;
        }
        Some(i64::from_be_bytes(
            bytes[MSG_STORE_TIMESTAMP_POSITION..MSG_STORE_TIMESTAMP_POSITION + 8]
                .try_into()
                .ok()?,
        ))
    }

    /// Recovery after a clean shutdown: everything was flushed, so scan the
    /// last few segments to find the exact end of the log
    pub fn recover_normally(&self) {
        let check_crc = self.config.check_crc_on_recover;
        let files = self.mapped_file_queue.mapped_files();
        if files.is_empty() {
            return;
        }

        // begin at the last third segment
        let mut index = files.len().saturating_sub(3);
        let mut file = Arc::clone(&files[index]);
        let mut process_offset = file.file_from_offset();
        let mut mapped_file_offset = 0usize;

        {
            let mut table = self.topic_queue_table.lock();
            loop {
                let request = match file.slice_from(0) {
                    Some(slice) => check_message_and_return_size(
                        &slice.as_slice()[mapped_file_offset..],
                        check_crc,
                        true,
                        &self.delay_levels,
                    ),
                    None => DispatchRequest::size_only(-1, false),
                };
                let size = request.msg_size;

                if request.success && size > 0 {
                    Self::replay_queue_offset(&mut table, &request);
                    mapped_file_offset += size as usize;
                } else if request.success && size == 0 {
                    // blank trailer: hop to the next segment; the blank is
                    // never part of the truncation point
                    index += 1;
                    if index >= files.len() {
                        info!(file = %file.path().display(), "recovered past the last segment");
                        break;
                    }
                    file = Arc::clone(&files[index]);
                    process_offset = file.file_from_offset();
                    mapped_file_offset = 0;
                    info!(file = %file.path().display(), "recovering next segment");
                } else {
                    info!(file = %file.path().display(), "recovery scan stopped");
                    break;
                }
            }
        }

        let process_offset = process_offset + mapped_file_offset as i64;
        self.mapped_file_queue.set_flushed_where(process_offset);
        self.mapped_file_queue.set_committed_where(process_offset);
        self.mapped_file_queue.truncate_dirty_files(process_offset);
    }

    /// Recovery after a crash: find the newest segment that is certainly
    /// covered by the checkpoint, then rescan forward rebuilding the
    /// secondary indexes through the dispatch sink
    pub fn recover_abnormally(&self) {
        let check_crc = self.config.check_crc_on_recover;
        let files = self.mapped_file_queue.mapped_files();
        if files.is_empty() {
            self.mapped_file_queue.set_flushed_where(0);
            self.mapped_file_queue.set_committed_where(0);
            self.dispatch.destroy();
            return;
        }

        let mut index = files.len() - 1;
        loop {
            if self.is_mapped_file_matched_recover(&files[index]) {
                info!(file = %files[index].path().display(), "recovering from this segment");
                break;
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }

        let mut file = Arc::clone(&files[index]);
        let mut process_offset = file.file_from_offset();
        let mut mapped_file_offset = 0usize;

        {
            let mut table = self.topic_queue_table.lock();
            loop {
                let request = match file.slice_from(0) {
                    Some(slice) => check_message_and_return_size(
                        &slice.as_slice()[mapped_file_offset..],
                        check_crc,
                        true,
                        &self.delay_levels,
                    ),
                    None => DispatchRequest::size_only(-1, false),
                };
                let size = request.msg_size;

                if request.success && size > 0 {
                    Self::replay_queue_offset(&mut table, &request);
                    if self.config.duplication_enable {
                        if request.commit_log_offset < self.confirm_offset() {
                            self.dispatch.dispatch(&request);
                        }
                    } else {
                        self.dispatch.dispatch(&request);
                    }
                    mapped_file_offset += size as usize;
                } else if request.success && size == 0 {
                    index += 1;
                    if index >= files.len() {
                        info!(file = %file.path().display(), "recovered past the last segment");
                        break;
                    }
                    file = Arc::clone(&files[index]);
                    process_offset = file.file_from_offset();
                    mapped_file_offset = 0;
                    info!(file = %file.path().display(), "recovering next segment");
                } else {
                    info!(file = %file.path().display(), "recovery scan stopped");
                    break;
                }
            }
        }

        let process_offset = process_offset + mapped_file_offset as i64;
        self.mapped_file_queue.set_flushed_where(process_offset);
        self.mapped_file_queue.set_committed_where(process_offset);
        self.mapped_file_queue.truncate_dirty_files(process_offset);

        // logical structures must not run past the physical log
        self.dispatch.truncate(process_offset);
    }

    fn replay_queue_offset(table: &mut HashMap<String, i64>, request: &DispatchRequest) {
        match sys_flag::transaction_type(request.sys_flag) {
            sys_flag::TRANSACTION_PREPARED_TYPE | sys_flag::TRANSACTION_ROLLBACK_TYPE => {}
            _ => {
                let key = topic_queue_key(&request.topic, request.queue_id);
                table.insert(key, request.consume_queue_offset + 1);
            }
        }
    }

    fn is_mapped_file_matched_recover(&self, file: &Arc<MappedFile>) -> bool {
        let Some(slice) = file.slice_from(0) else {
            return false;
        };
        let bytes = slice.as_slice();
        if bytes.len() < MSG_STORE_TIMESTAMP_POSITION + 8 {
            return false;
        }

        let magic = i32::from_be_bytes(
            bytes[MSG_MAGIC_POSITION..MSG_MAGIC_POSITION + 4]
                .try_into()
                .unwrap_or_default(),
        );
        if magic != MESSAGE_MAGIC_CODE {
            return false;
        }

        let store_timestamp = i64::from_be_bytes(
            bytes[MSG_STORE_TIMESTAMP_POSITION..MSG_STORE_TIMESTAMP_POSITION + 8]
                .try_into()
                .unwrap_or_default(),
        );
        if store_timestamp == 0 {
            return false;
        }

        let threshold = if self.config.message_index_enable && self.config.message_index_safe {
            self.checkpoint.min_timestamp_index()
        } else {
            self.checkpoint.min_timestamp()
        };
        if store_timestamp <= threshold {
            info!(store_timestamp, threshold, "found checkpointed segment");
            return true;
        }
        false
    }

    /// Retire whole segments older than `expired_ms`
    pub fn delete_expired_file(
        &self,
        expired_ms: i64,
        delete_files_interval_ms: u64,
        clean_immediately: bool,
    ) -> usize {
        self.mapped_file_queue.delete_expired_files_by_time(
            expired_ms,
            delete_files_interval_ms,
            clean_immediately,
        )
    }

    pub fn retry_delete_first_file(&self) -> bool {
        self.mapped_file_queue.retry_delete_first_file()
    }

    pub fn reset_offset(&self, offset: i64) -> bool {
        self.mapped_file_queue.reset_offset(offset)
    }

    /// Delete every segment of the log
    pub fn destroy(&self) {
        self.mapped_file_queue.destroy();
    }

    /// Decode helper sharing the engine's delay table (used by readers and
    /// tests)
    pub fn check_message(&self, bytes: &[u8], check_crc: bool) -> DispatchRequest {
        check_message_and_return_size(bytes, check_crc, true, &self.delay_levels)
    }
}
