//! Message model for the Flowline commit log
//!
//! A [`Message`] is the broker-internal form of a producer record before it
//! is serialized into the log. Properties travel as a flat string of
//! `key\u{01}value\u{02}key\u{01}value…` pairs; a handful of keys are
//! reserved for broker features (tags, scheduled delivery, unique ids).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

/// Separator between a property name and its value
pub const NAME_VALUE_SEPARATOR: char = '\u{0001}';

/// Separator between properties
pub const PROPERTY_SEPARATOR: char = '\u{0002}';

/// Reserved property keys
pub const PROPERTY_KEYS: &str = "KEYS";
pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_UNIQ_KEY: &str = "UNIQ_KEY";
pub const PROPERTY_DELAY: &str = "DELAY";
pub const PROPERTY_REAL_TOPIC: &str = "REAL_TOPIC";
pub const PROPERTY_REAL_QUEUE_ID: &str = "REAL_QID";

/// System flag bitfield layout
pub mod sys_flag {
    /// Transaction phase mask (bits 2-3)
    pub const TRANSACTION_TYPE_MASK: i32 = 0x3 << 2;
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;

    /// Born host is in IPv6 form (reserved; this broker emits IPv4 hosts)
    pub const BORN_HOST_V6_FLAG: i32 = 0x1 << 4;
    /// Store host is in IPv6 form (reserved)
    pub const STORE_HOST_V6_FLAG: i32 = 0x1 << 5;
    /// Record was appended as part of a batch
    pub const BATCH_FLAG: i32 = 0x1 << 7;

    /// Extract the transaction phase from a system flag
    pub fn transaction_type(flag: i32) -> i32 {
        flag & TRANSACTION_TYPE_MASK
    }
}

/// Broker-internal message, ready for the append path
#[derive(Debug, Clone)]
pub struct Message {
    /// Destination topic
    pub topic: String,

    /// Logical queue within the topic
    pub queue_id: i32,

    /// Opaque producer flag, stored verbatim
    pub flag: i32,

    /// Message payload
    pub body: Bytes,

    /// System flag bitfield (see [`sys_flag`])
    pub sys_flag: i32,

    /// Producer wall clock in milliseconds
    pub born_timestamp: i64,

    /// Producer address
    pub born_host: SocketAddrV4,

    /// Assigned under the append lock for global ordering
    pub store_timestamp: i64,

    /// Broker address
    pub store_host: SocketAddrV4,

    /// Delivery attempts so far
    pub reconsume_times: i32,

    /// Commit log offset of the prepared record (two-phase transactions)
    pub prepared_transaction_offset: i64,

    /// Scheduled delivery level; 0 means immediate
    pub delay_level: i32,

    /// User and broker properties
    pub properties: HashMap<String, String>,

    /// Producer asked to be acknowledged only after the durability policy
    /// is satisfied
    pub wait_store_ok: bool,

    /// CRC-32 of the body, computed on the producer thread
    pub body_crc: u32,
}

impl Message {
    /// Create a message with defaults for everything but the routing fields
    pub fn new(topic: impl Into<String>, queue_id: i32, body: Bytes) -> Self {
        let localhost = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body,
            sys_flag: 0,
            born_timestamp: 0,
            born_host: localhost,
            store_timestamp: 0,
            store_host: localhost,
            reconsume_times: 0,
            prepared_transaction_offset: 0,
            delay_level: 0,
            properties: HashMap::new(),
            wait_store_ok: true,
            body_crc: 0,
        }
    }

    pub fn put_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    pub fn transaction_type(&self) -> i32 {
        sys_flag::transaction_type(self.sys_flag)
    }
}

/// Encode a property map into the flat on-disk string form
pub fn properties_to_string(properties: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in properties {
        out.push_str(name);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Parse the flat on-disk property string back into a map
pub fn string_to_properties(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for item in raw.split(PROPERTY_SEPARATOR) {
        if item.is_empty() {
            continue;
        }
        match item.split_once(NAME_VALUE_SEPARATOR) {
            Some((name, value)) => {
                map.insert(name.to_string(), value.to_string());
            }
            None => {
                map.insert(item.to_string(), String::new());
            }
        }
    }
    map
}

/// Encode a socket address as the fixed 8-byte on-disk host form
/// (4 bytes IPv4 address + 4 bytes port, big-endian)
pub fn host_to_bytes(addr: SocketAddrV4) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&addr.ip().octets());
    out[4..8].copy_from_slice(&(addr.port() as i32).to_be_bytes());
    out
}

/// Decode the fixed 8-byte host form back into a socket address
pub fn host_from_bytes(raw: &[u8; 8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as u16;
    SocketAddrV4::new(ip, port)
}

/// Build the 16-byte message id (store host followed by the physical
/// offset), rendered as 32 hex characters
pub fn create_message_id(store_host: SocketAddrV4, wrote_offset: i64) -> String {
    let mut raw = [0u8; 16];
    raw[0..8].copy_from_slice(&host_to_bytes(store_host));
    raw[8..16].copy_from_slice(&wrote_offset.to_be_bytes());

    let mut out = String::with_capacity(32);
    for b in raw {
        use std::fmt::Write;
        // infallible for String
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// 64-bit hash of a tags string: a 31-multiplier rolling hash over UTF-16
/// code units, widened to i64
pub fn tags_string_to_tags_code(tags: &str) -> i64 {
    let mut hash: i32 = 0;
    for unit in tags.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    i64::from(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip() {
        let mut props = HashMap::new();
        props.insert("TAGS".to_string(), "tagA".to_string());
        props.insert("KEYS".to_string(), "order-17".to_string());
        props.insert("custom".to_string(), "value".to_string());

        let encoded = properties_to_string(&props);
        let decoded = string_to_properties(&encoded);
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_properties_value_less_entry() {
        let decoded = string_to_properties("solo\u{02}a\u{01}b\u{02}");
        assert_eq!(decoded.get("solo"), Some(&String::new()));
        assert_eq!(decoded.get("a"), Some(&"b".to_string()));
    }

    #[test]
    fn test_host_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 3, 7), 10911);
        assert_eq!(host_from_bytes(&host_to_bytes(addr)), addr);
    }

    #[test]
    fn test_message_id_shape() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 10911);
        let id = create_message_id(addr, 4096);
        assert_eq!(id.len(), 32);
        // host portion: 7F 00 00 01 + port 10911 = 0x2A9F
        assert!(id.starts_with("7F00000100002A9F"));
        assert!(id.ends_with("0000000000001000"));
    }

    #[test]
    fn test_tags_code_stable() {
        // Same input must always hash the same; different inputs differ.
        assert_eq!(tags_string_to_tags_code("TagA"), tags_string_to_tags_code("TagA"));
        assert_ne!(tags_string_to_tags_code("TagA"), tags_string_to_tags_code("TagB"));
    }

    #[test]
    fn test_transaction_type_extraction() {
        assert_eq!(
            sys_flag::transaction_type(sys_flag::TRANSACTION_PREPARED_TYPE | sys_flag::BATCH_FLAG),
            sys_flag::TRANSACTION_PREPARED_TYPE
        );
        assert_eq!(sys_flag::transaction_type(0), sys_flag::TRANSACTION_NOT_TYPE);
    }
}
