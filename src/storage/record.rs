//! Record codec for the commit log
//!
//! Every persisted record is a self-describing byte sequence; all integers
//! are big-endian. Field order:
//!
//! ```text
//! total_size(4) magic(4) body_crc(4) queue_id(4) flag(4)
//! queue_offset(8) physical_offset(8) sys_flag(4) born_timestamp(8)
//! born_host(8) store_timestamp(8) store_host(8) reconsume_times(4)
//! prepared_transaction_offset(8) body_len(4)+body topic_len(1)+topic
//! props_len(2)+props
//! ```
//!
//! A segment whose tail cannot hold the next record is closed with a single
//! BLANK record: `total_size` spans the remaining bytes and the magic is
//! [`BLANK_MAGIC_CODE`]. Decoding reports BLANK as end-of-segment (size 0)
//! and an unrecognized magic or CRC mismatch as corrupt (size -1).

use std::collections::HashMap;
use std::net::SocketAddrV4;

use tracing::{error, warn};

use crate::storage::message::{
    host_to_bytes, string_to_properties, tags_string_to_tags_code, Message, PROPERTY_DELAY,
    PROPERTY_KEYS, PROPERTY_TAGS, PROPERTY_UNIQ_KEY,
};
use crate::storage::schedule::{DelayLevelTable, SCHEDULE_TOPIC};

/// Magic marking a message record
pub const MESSAGE_MAGIC_CODE: i32 = 0xDAA3_20A7_u32 as i32;

/// Magic marking the blank record padding a segment tail
pub const BLANK_MAGIC_CODE: i32 = 0xCBD4_3194_u32 as i32;

/// Minimum tail space a record must leave for a blank trailer
pub const END_FILE_MIN_BLANK_LENGTH: usize = 4 + 4;

/// Byte offset of the magic within a record
pub const MSG_MAGIC_POSITION: usize = 4;

/// Byte offset of the queue offset within a record
pub const MSG_QUEUE_OFFSET_POSITION: usize = 20;

/// Byte offset of the physical offset within a record
pub const MSG_PHYSICAL_OFFSET_POSITION: usize = 28;

/// Byte offset of the store timestamp within a record
pub const MSG_STORE_TIMESTAMP_POSITION: usize = 56;

/// Total record length for the given variable field lengths
pub fn cal_msg_length(body_len: i32, topic_len: usize, props_len: usize) -> i32 {
    4 // total_size
        + 4 // magic
        + 4 // body_crc
        + 4 // queue_id
        + 4 // flag
        + 8 // queue_offset
        + 8 // physical_offset
        + 4 // sys_flag
        + 8 // born_timestamp
        + 8 // born_host
        + 8 // store_timestamp
        + 8 // store_host
        + 4 // reconsume_times
        + 8 // prepared_transaction_offset
        + 4 + body_len.max(0) // body
        + 1 + topic_len as i32 // topic
        + 2 + props_len as i32 // properties
}

/// Serialize a full record into `out`, returning the record length
///
/// The caller has already validated topic/properties/body sizes and
/// resolved `queue_offset` and `physical_offset`.
pub fn encode_message(
    out: &mut Vec<u8>,
    msg: &Message,
    properties: &str,
    queue_offset: i64,
    physical_offset: i64,
) -> usize {
    let body_len = msg.body.len() as i32;
    let topic_data = msg.topic.as_bytes();
    let props_data = properties.as_bytes();
    let msg_len = cal_msg_length(body_len, topic_data.len(), props_data.len()) as usize;

    out.reserve(msg_len);
    out.extend_from_slice(&(msg_len as i32).to_be_bytes());
    out.extend_from_slice(&MESSAGE_MAGIC_CODE.to_be_bytes());
    out.extend_from_slice(&(msg.body_crc as i32).to_be_bytes());
    out.extend_from_slice(&msg.queue_id.to_be_bytes());
    out.extend_from_slice(&msg.flag.to_be_bytes());
    out.extend_from_slice(&queue_offset.to_be_bytes());
    out.extend_from_slice(&physical_offset.to_be_bytes());
    out.extend_from_slice(&msg.sys_flag.to_be_bytes());
    out.extend_from_slice(&msg.born_timestamp.to_be_bytes());
    out.extend_from_slice(&host_to_bytes(msg.born_host));
    out.extend_from_slice(&msg.store_timestamp.to_be_bytes());
    out.extend_from_slice(&host_to_bytes(msg.store_host));
    out.extend_from_slice(&msg.reconsume_times.to_be_bytes());
    out.extend_from_slice(&msg.prepared_transaction_offset.to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&msg.body);
    out.push(topic_data.len() as u8);
    out.extend_from_slice(topic_data);
    out.extend_from_slice(&(props_data.len() as i16).to_be_bytes());
    out.extend_from_slice(props_data);

    msg_len
}

/// Decoded view of one record, handed to secondary index dispatch
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: i32,
    /// Physical offset the record starts at
    pub commit_log_offset: i64,
    /// Record length; 0 marks end-of-segment, -1 marks corruption
    pub msg_size: i32,
    /// Tags hash, or the deliver timestamp for scheduled records
    pub tags_code: i64,
    pub store_timestamp: i64,
    pub consume_queue_offset: i64,
    pub keys: String,
    pub uniq_key: Option<String>,
    pub sys_flag: i32,
    pub prepared_transaction_offset: i64,
    pub born_host: SocketAddrV4,
    pub store_host: SocketAddrV4,
    pub properties: Option<HashMap<String, String>>,
    pub success: bool,
}

impl DispatchRequest {
    /// End-of-segment or corruption marker
    pub fn size_only(msg_size: i32, success: bool) -> Self {
        Self {
            topic: String::new(),
            queue_id: 0,
            commit_log_offset: 0,
            msg_size,
            tags_code: 0,
            store_timestamp: 0,
            consume_queue_offset: 0,
            keys: String::new(),
            uniq_key: None,
            sys_flag: 0,
            prepared_transaction_offset: 0,
            born_host: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            store_host: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            properties: None,
            success,
        }
    }
}

/// Bounds-checked big-endian reader over a record slice
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn get_i16(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_be_bytes([b[0], b[1]]))
    }

    fn get_i32(&mut self) -> Option<i32> {
        self.take(4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i64(&mut self) -> Option<i64> {
        self.take(8)
            .map(|b| i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn get_host(&mut self) -> Option<SocketAddrV4> {
        let raw = self.take(8)?;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(raw);
        Some(crate::storage::message::host_from_bytes(&fixed))
    }
}

/// Decode the record at the start of `buf`
///
/// Returns end-of-segment (size 0) for a BLANK record, corrupt (size -1)
/// for an unrecognized magic, a truncated record or a CRC mismatch, and a
/// corrupt result carrying the declared size when the declared and computed
/// lengths disagree.
pub fn check_message_and_return_size(
    buf: &[u8],
    check_crc: bool,
    read_body: bool,
    delay_levels: &DelayLevelTable,
) -> DispatchRequest {
    check_message_inner(buf, check_crc, read_body, delay_levels)
        .unwrap_or_else(|| DispatchRequest::size_only(-1, false))
}

fn check_message_inner(
    buf: &[u8],
    check_crc: bool,
    read_body: bool,
    delay_levels: &DelayLevelTable,
) -> Option<DispatchRequest> {
    let mut cursor = ByteCursor::new(buf);

    let total_size = cursor.get_i32()?;
    let magic = cursor.get_i32()?;
    match magic {
        MESSAGE_MAGIC_CODE => {}
        BLANK_MAGIC_CODE => return Some(DispatchRequest::size_only(0, true)),
        other => {
            warn!("found an illegal magic code {:#010x}", other);
            return Some(DispatchRequest::size_only(-1, false));
        }
    }

    let body_crc = cursor.get_i32()?;
    let queue_id = cursor.get_i32()?;
    let _flag = cursor.get_i32()?;
    let queue_offset = cursor.get_i64()?;
    let physic_offset = cursor.get_i64()?;
    let sys_flag = cursor.get_i32()?;
    let _born_timestamp = cursor.get_i64()?;
    let born_host = cursor.get_host()?;
    let store_timestamp = cursor.get_i64()?;
    let store_host = cursor.get_host()?;
    let _reconsume_times = cursor.get_i32()?;
    let prepared_transaction_offset = cursor.get_i64()?;

    let body_len = cursor.get_i32()?;
    if body_len < 0 {
        return None;
    }
    if body_len > 0 {
        if read_body {
            let body = cursor.take(body_len as usize)?;
            if check_crc {
                let crc = crc32fast::hash(body);
                if crc != body_crc as u32 {
                    warn!(
                        expected = body_crc as u32,
                        computed = crc,
                        "body CRC check failed"
                    );
                    return Some(DispatchRequest::size_only(-1, false));
                }
            }
        } else {
            cursor.skip(body_len as usize)?;
        }
    }

    let topic_len = cursor.get_u8()?;
    let topic = String::from_utf8_lossy(cursor.take(topic_len as usize)?).into_owned();

    let mut tags_code = 0i64;
    let mut keys = String::new();
    let mut uniq_key = None;

    let props_len = cursor.get_i16()?;
    if props_len < 0 {
        return None;
    }
    let mut properties_map = None;
    if props_len > 0 {
        let raw = String::from_utf8_lossy(cursor.take(props_len as usize)?).into_owned();
        let map = string_to_properties(&raw);

        if let Some(k) = map.get(PROPERTY_KEYS) {
            keys = k.clone();
        }
        uniq_key = map.get(PROPERTY_UNIQ_KEY).cloned();

        if let Some(tags) = map.get(PROPERTY_TAGS) {
            if !tags.is_empty() {
                tags_code = tags_string_to_tags_code(tags);
            }
        }

        // Scheduled delivery: the replay key becomes the deliver timestamp.
        if topic == SCHEDULE_TOPIC {
            if let Some(delay) = map.get(PROPERTY_DELAY) {
                if let Ok(level) = delay.parse::<i32>() {
                    let level = delay_levels.clamp_level(level);
                    if level > 0 {
                        tags_code =
                            delay_levels.compute_deliver_timestamp(level, store_timestamp);
                    }
                }
            }
        }

        properties_map = Some(map);
    }

    let read_length = cal_msg_length(body_len, topic_len as usize, props_len as usize);
    if total_size != read_length {
        error!(
            total_size,
            read_length, body_len, topic_len, props_len, "declared and computed record length differ"
        );
        return Some(DispatchRequest::size_only(total_size, false));
    }

    Some(DispatchRequest {
        topic,
        queue_id,
        commit_log_offset: physic_offset,
        msg_size: total_size,
        tags_code,
        store_timestamp,
        consume_queue_offset: queue_offset,
        keys,
        uniq_key,
        sys_flag,
        prepared_transaction_offset,
        born_host,
        store_host,
        properties: properties_map,
        success: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::message::properties_to_string;
    use bytes::Bytes;

    fn delay_table() -> DelayLevelTable {
        DelayLevelTable::parse(crate::config::DEFAULT_DELAY_LEVELS).unwrap()
    }

    fn sample_message() -> Message {
        let mut msg = Message::new("orders", 3, Bytes::from_static(b"hello commit log"));
        msg.flag = 7;
        msg.born_timestamp = 1_700_000_000_000;
        msg.store_timestamp = 1_700_000_000_500;
        msg.reconsume_times = 2;
        msg.put_property(PROPERTY_TAGS, "TagA");
        msg.put_property(PROPERTY_KEYS, "order-17");
        msg.body_crc = crc32fast::hash(&msg.body);
        msg
    }

    fn encode(msg: &Message, queue_offset: i64, physical_offset: i64) -> Vec<u8> {
        let props = properties_to_string(&msg.properties);
        let mut out = Vec::new();
        encode_message(&mut out, msg, &props, queue_offset, physical_offset);
        out
    }

    #[test]
    fn test_magic_constants() {
        assert_eq!(MESSAGE_MAGIC_CODE as u32, 0xDAA3_20A7);
        assert_eq!(BLANK_MAGIC_CODE as u32, 0xCBD4_3194);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let msg = sample_message();
        let encoded = encode(&msg, 42, 8192);

        let total = i32::from_be_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(total as usize, encoded.len());

        let req = check_message_and_return_size(&encoded, true, true, &delay_table());
        assert!(req.success);
        assert_eq!(req.msg_size as usize, encoded.len());
        assert_eq!(req.topic, "orders");
        assert_eq!(req.queue_id, 3);
        assert_eq!(req.consume_queue_offset, 42);
        assert_eq!(req.commit_log_offset, 8192);
        assert_eq!(req.store_timestamp, 1_700_000_000_500);
        assert_eq!(req.keys, "order-17");
        assert_eq!(req.tags_code, tags_string_to_tags_code("TagA"));
        assert_eq!(req.born_host, msg.born_host);
        assert_eq!(req.store_host, msg.store_host);
    }

    #[test]
    fn test_total_size_matches_cal_msg_length() {
        let msg = sample_message();
        let props = properties_to_string(&msg.properties);
        let encoded = encode(&msg, 0, 0);
        assert_eq!(
            encoded.len() as i32,
            cal_msg_length(msg.body.len() as i32, msg.topic.len(), props.len())
        );
    }

    #[test]
    fn test_blank_record_is_end_of_segment() {
        let mut blank = Vec::new();
        blank.extend_from_slice(&64i32.to_be_bytes());
        blank.extend_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
        blank.resize(64, 0);

        let req = check_message_and_return_size(&blank, true, true, &delay_table());
        assert!(req.success);
        assert_eq!(req.msg_size, 0);
    }

    #[test]
    fn test_unknown_magic_is_corrupt() {
        let mut bad = encode(&sample_message(), 0, 0);
        bad[4..8].copy_from_slice(&0x1234_5678i32.to_be_bytes());

        let req = check_message_and_return_size(&bad, true, true, &delay_table());
        assert!(!req.success);
        assert_eq!(req.msg_size, -1);
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let mut bad = encode(&sample_message(), 0, 0);
        // flip a body byte; the body starts at fixed offset 88
        bad[90] ^= 0xFF;

        let req = check_message_and_return_size(&bad, true, true, &delay_table());
        assert!(!req.success);
        assert_eq!(req.msg_size, -1);

        // with CRC checking disabled the record still parses
        let req = check_message_and_return_size(&bad, false, true, &delay_table());
        assert!(req.success);
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let encoded = encode(&sample_message(), 0, 0);
        let truncated = &encoded[..encoded.len() - 5];

        let req = check_message_and_return_size(truncated, true, true, &delay_table());
        assert!(!req.success);
        assert_eq!(req.msg_size, -1);
    }

    #[test]
    fn test_declared_length_mismatch_reports_declared_size() {
        let mut bad = encode(&sample_message(), 0, 0);
        let declared = i32::from_be_bytes(bad[0..4].try_into().unwrap()) + 9;
        bad[0..4].copy_from_slice(&declared.to_be_bytes());
        // keep the buffer long enough that parsing reaches the length check
        bad.resize(bad.len() + 9, 0);

        let req = check_message_and_return_size(&bad, true, true, &delay_table());
        assert!(!req.success);
        assert_eq!(req.msg_size, declared);
    }

    #[test]
    fn test_scheduled_record_tags_code_is_deliver_timestamp() {
        let table = delay_table();
        let mut msg = sample_message();
        msg.topic = SCHEDULE_TOPIC.to_string();
        msg.queue_id = 2;
        msg.put_property(PROPERTY_DELAY, "3");
        let encoded = encode(&msg, 0, 0);

        let req = check_message_and_return_size(&encoded, true, true, &table);
        assert!(req.success);
        assert_eq!(
            req.tags_code,
            table.compute_deliver_timestamp(3, msg.store_timestamp)
        );
    }

    #[test]
    fn test_empty_body_and_long_topic_are_legal() {
        let mut msg = sample_message();
        msg.topic = "t".repeat(255);
        msg.body = Bytes::new();
        msg.body_crc = 0;
        let encoded = encode(&msg, 0, 0);

        let req = check_message_and_return_size(&encoded, true, true, &delay_table());
        assert!(req.success);
        assert_eq!(req.topic.len(), 255);
    }
}
