//! Producer batch encoding
//!
//! A batch is pre-encoded on the producer thread into one contiguous run of
//! records sharing topic, queue and system fields. The `queue_offset` and
//! `physical_offset` fields are written as zero placeholders; the append
//! engine patches them (plus the store timestamp) once offsets are assigned
//! under the lock. Encoders are leased per caller so the hot path never
//! allocates.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use tracing::warn;

use crate::storage::message::{host_to_bytes, properties_to_string};
use crate::storage::record::{cal_msg_length, MESSAGE_MAGIC_CODE};

/// Why a batch failed to encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEncodeError {
    MessageSizeExceeded,
    PropertiesSizeExceeded,
}

/// One record inside a batch; routing fields come from the batch itself
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub flag: i32,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}

impl BatchMessage {
    pub fn new(body: Bytes) -> Self {
        Self {
            flag: 0,
            body,
            properties: HashMap::new(),
        }
    }
}

/// A producer batch bound for a single (topic, queue)
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub topic: String,
    pub queue_id: i32,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub born_host: SocketAddrV4,
    pub store_timestamp: i64,
    pub store_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub delay_level: i32,
    pub wait_store_ok: bool,
    pub messages: Vec<BatchMessage>,
}

impl MessageBatch {
    pub fn new(topic: impl Into<String>, queue_id: i32, messages: Vec<BatchMessage>) -> Self {
        let localhost = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        Self {
            topic: topic.into(),
            queue_id,
            sys_flag: 0,
            born_timestamp: 0,
            born_host: localhost,
            store_timestamp: 0,
            store_host: localhost,
            reconsume_times: 0,
            delay_level: 0,
            wait_store_ok: true,
            messages,
        }
    }
}

/// Reusable batch serializer, leased per appender
pub struct BatchEncoder {
    buffer: Vec<u8>,
    max_message_bytes: usize,
}

impl BatchEncoder {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_message_bytes),
            max_message_bytes,
        }
    }

    /// Encode the batch into the internal buffer
    ///
    /// Size limits are enforced here, before the append lock is taken: one
    /// oversized record or an oversized total fails the whole batch.
    pub fn encode(&mut self, batch: &MessageBatch) -> Result<(), BatchEncodeError> {
        self.buffer.clear();
        let topic_data = batch.topic.as_bytes();
        if topic_data.len() > u8::MAX as usize {
            warn!(topic_len = topic_data.len(), "batch topic too long");
            return Err(BatchEncodeError::MessageSizeExceeded);
        }

        let mut total_len = 0usize;
        for message in &batch.messages {
            let properties = properties_to_string(&message.properties);
            if properties.len() > i16::MAX as usize {
                warn!(len = properties.len(), "batch message properties too long");
                return Err(BatchEncodeError::PropertiesSizeExceeded);
            }

            let body_len = message.body.len() as i32;
            let msg_len =
                cal_msg_length(body_len, topic_data.len(), properties.len()) as usize;
            if msg_len > self.max_message_bytes {
                warn!(
                    msg_len,
                    max = self.max_message_bytes,
                    "batch message size exceeded"
                );
                return Err(BatchEncodeError::MessageSizeExceeded);
            }
            total_len += msg_len;
            if total_len > self.max_message_bytes {
                warn!(
                    total_len,
                    max = self.max_message_bytes,
                    "batch total size exceeded"
                );
                return Err(BatchEncodeError::MessageSizeExceeded);
            }

            let body_crc = crc32fast::hash(&message.body);

            let out = &mut self.buffer;
            out.extend_from_slice(&(msg_len as i32).to_be_bytes());
            out.extend_from_slice(&MESSAGE_MAGIC_CODE.to_be_bytes());
            out.extend_from_slice(&(body_crc as i32).to_be_bytes());
            out.extend_from_slice(&batch.queue_id.to_be_bytes());
            out.extend_from_slice(&message.flag.to_be_bytes());
            // queue offset and physical offset: patched under the lock
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&batch.sys_flag.to_be_bytes());
            out.extend_from_slice(&batch.born_timestamp.to_be_bytes());
            out.extend_from_slice(&host_to_bytes(batch.born_host));
            out.extend_from_slice(&batch.store_timestamp.to_be_bytes());
            out.extend_from_slice(&host_to_bytes(batch.store_host));
            out.extend_from_slice(&batch.reconsume_times.to_be_bytes());
            // batches do not participate in transactions
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&body_len.to_be_bytes());
            out.extend_from_slice(&message.body);
            out.push(topic_data.len() as u8);
            out.extend_from_slice(topic_data);
            out.extend_from_slice(&(properties.len() as i16).to_be_bytes());
            out.extend_from_slice(properties.as_bytes());
        }

        Ok(())
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

/// Read a big-endian i32 out of a patched batch buffer
pub(crate) fn read_i32_at(buf: &[u8], pos: usize) -> i32 {
    i32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Patch a big-endian i64 into a batch buffer hole
pub(crate) fn write_i64_at(buf: &mut [u8], pos: usize, value: i64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}
